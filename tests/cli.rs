use assert_cmd::Command;
use predicates::prelude::*;

fn verifeed() -> Command {
    let mut cmd = Command::cargo_bin("verifeed").expect("binary built");
    cmd.env_remove("VERIFEED_API__BASE_URL")
        .env_remove("VERIFEED_FEED__PAGE_SIZE")
        .arg("--config")
        .arg("/nonexistent/verifeed-test.yaml");
    cmd
}

#[test]
fn prints_version() {
    verifeed()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    verifeed()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Verifeed"))
        .stdout(predicate::str::contains("--offline"));
}

#[test]
fn offline_feed_pages_to_the_end() {
    verifeed()
        .args(["--offline", "--pages", "5"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "Following: 2 pages, 21 items, end of feed",
        ))
        .stdout(predicate::str::contains("  1. post:9001 @you [not_applicable] Your new post"))
        .stdout(predicate::str::contains(" 13. reel:12 @amara"))
        .stdout(predicate::str::contains(" 21. post:20 @amara"));
}

#[test]
fn offline_explore_single_page() {
    verifeed()
        .args(["--offline", "--feed", "explore"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "Explore: 1 page, 12 items, more available",
        ))
        .stdout(predicate::str::contains("post:1001"));
}

#[test]
fn rejects_zero_pages() {
    verifeed()
        .args(["--offline", "--pages", "0"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--pages"));
}

#[test]
fn rejects_unknown_arguments() {
    verifeed()
        .arg("--frobnicate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unexpected argument"));
}
