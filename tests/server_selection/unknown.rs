use super::framework::run_suites;

#[test]
fn server_selection_unknown_read() {
    run_suites("tests/json/data/server_selection/Unknown/read");
}

#[test]
fn server_selection_unknown_write() {
    run_suites("tests/json/data/server_selection/Unknown/write");
}
