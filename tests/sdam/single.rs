use super::framework::run_suites;

#[test]
fn sdam_single() {
    run_suites("tests/json/data/sdam/single");
}
