//! Unit tests for the HMAC token verifier

use fxbridge::auth::{HmacTokenVerifier, TokenVerifier};
use uuid::Uuid;

#[test]
fn issued_tokens_verify() {
    let verifier = HmacTokenVerifier::new("test-secret");
    let user_id = Uuid::new_v4();

    let token = verifier.issue(user_id);
    let user = verifier.verify(&token).unwrap();
    assert_eq!(user.id, user_id);
}

#[test]
fn tampered_subject_is_rejected() {
    let verifier = HmacTokenVerifier::new("test-secret");
    let token = verifier.issue(Uuid::new_v4());

    let (_, signature) = token.split_once('.').unwrap();
    let forged = format!("{}.{}", Uuid::new_v4(), signature);
    assert!(verifier.verify(&forged).is_err());
}

#[test]
fn wrong_secret_is_rejected() {
    let token = HmacTokenVerifier::new("secret-a").issue(Uuid::new_v4());
    assert!(HmacTokenVerifier::new("secret-b").verify(&token).is_err());
}

#[test]
fn malformed_tokens_are_rejected() {
    let verifier = HmacTokenVerifier::new("test-secret");
    assert!(verifier.verify("").is_err());
    assert!(verifier.verify("no-dot-here").is_err());
    assert!(verifier.verify("not-a-uuid.c2lnbmF0dXJl").is_err());
    assert!(verifier.verify(&format!("{}.!!!", Uuid::new_v4())).is_err());
}
