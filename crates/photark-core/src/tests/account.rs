use crate::account::AccountKey;

#[test]
fn key_is_provider_colon_username() {
    let account = AccountKey::new("memory", "someone@example.com");
    assert_eq!(account.key(), "memory:someone@example.com");
}

#[test]
fn key_is_lowercased() {
    let account = AccountKey::new("Memory", "Someone@Example.COM");
    assert_eq!(account.key(), "memory:someone@example.com");
    assert_eq!(account.provider(), "memory");
    assert_eq!(account.username(), "someone@example.com");
}

#[test]
fn path_sanitizes_username() {
    let account = AccountKey::new("memory", "someone@example.com");
    assert_eq!(account.path(), "memory/someone_at_example.com");

    let account = AccountKey::new("memory", "user+tag@example.com");
    assert_eq!(account.path(), "memory/user_tag_at_example.com");
}

#[test]
fn display_matches_key() {
    let account = AccountKey::new("memory", "user");
    assert_eq!(account.to_string(), account.key());
}
