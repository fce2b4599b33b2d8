use pretty_assertions::assert_eq;
use sshkey_authorized_keys::{
    render, update, AuthorizedKeysError, MissingFilePolicy, UpdateOutcome,
};
use sshkey_protocol::{UserRecord, UserRecordList};
use tempfile::TempDir;

fn team_snippet() -> String {
    let records: UserRecordList = vec![
        UserRecord::new("alice", 10)
            .with_name("Alice")
            .with_keys("ssh-ed25519 AAAAalice"),
        UserRecord::new("bob", 11).with_keys("ssh-rsa AAAAbob1\nssh-rsa AAAAbob2"),
    ]
    .into();
    render(&records).expect("render")
}

#[test]
fn second_identical_update_is_a_no_op() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("authorized_keys");
    std::fs::write(&path, "ssh-rsa OPERATOR\n").expect("seed");
    let snippet = team_snippet();

    assert_eq!(
        update(&path, &snippet, MissingFilePolicy::Create).unwrap(),
        UpdateOutcome::Updated
    );
    let first = std::fs::read(&path).unwrap();

    assert_eq!(
        update(&path, &snippet, MissingFilePolicy::Create).unwrap(),
        UpdateOutcome::NotChanged
    );
    assert_eq!(std::fs::read(&path).unwrap(), first);
    assert_eq!(
        String::from_utf8(first).unwrap(),
        format!("ssh-rsa OPERATOR\n\n{snippet}")
    );
}

#[test]
fn unchanged_block_keeps_surrounding_lines() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("authorized_keys");
    let snippet = team_snippet();
    let original = format!("# managed by hand\nssh-rsa A\n{snippet}ssh-rsa C\n");
    std::fs::write(&path, &original).expect("seed");

    assert_eq!(
        update(&path, &snippet, MissingFilePolicy::Create).unwrap(),
        UpdateOutcome::NotChanged
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
}

#[test]
fn malformed_file_is_left_untouched() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("authorized_keys");
    let original = "ssh-rsa A\n# END: github_sshkey_provider\n";
    std::fs::write(&path, original).expect("seed");

    let err = update(&path, &team_snippet(), MissingFilePolicy::Create).unwrap_err();
    assert!(err.is_malformed(), "unexpected error: {err}");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
}

#[test]
fn missing_file_follows_policy() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("authorized_keys");
    let snippet = team_snippet();

    let err = update(&path, &snippet, MissingFilePolicy::Error).unwrap_err();
    assert!(matches!(err, AuthorizedKeysError::MissingFile(ref p) if p == &path));
    assert!(!path.exists());

    assert_eq!(
        update(&path, &snippet, MissingFilePolicy::Create).unwrap(),
        UpdateOutcome::Updated
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), snippet);
}

#[cfg(unix)]
#[test]
fn written_file_is_owner_only_and_temp_is_gone() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("authorized_keys");
    std::fs::write(&path, "").expect("seed");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

    update(&path, &team_snippet(), MissingFilePolicy::Create).unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn membership_change_rewrites_only_the_block() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("authorized_keys");
    std::fs::write(&path, "ssh-rsa BEFORE\n").expect("seed");
    update(&path, &team_snippet(), MissingFilePolicy::Create).unwrap();
    std::fs::write(
        &path,
        format!("{}ssh-rsa AFTER\n", std::fs::read_to_string(&path).unwrap()),
    )
    .unwrap();

    let smaller = render(&vec![UserRecord::new("carol", 12).with_keys("ssh-rsa C")].into())
        .unwrap();
    assert_eq!(
        update(&path, &smaller, MissingFilePolicy::Create).unwrap(),
        UpdateOutcome::Updated
    );
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        format!("ssh-rsa BEFORE\n\n{smaller}ssh-rsa AFTER\n")
    );
}
