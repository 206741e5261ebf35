use super::framework::run_suites;

#[test]
fn sdam_rs() {
    run_suites("tests/json/data/sdam/rs");
}
