use super::framework::run_suites;

#[test]
fn server_selection_replica_set_with_primary_read() {
    run_suites("tests/json/data/server_selection/ReplicaSetWithPrimary/read");
}

#[test]
fn server_selection_replica_set_with_primary_write() {
    run_suites("tests/json/data/server_selection/ReplicaSetWithPrimary/write");
}
