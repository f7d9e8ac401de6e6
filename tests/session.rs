// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

mod common;

use common::{auth_session, save_session, CountingStore};
use nvundefine::{
    crypto::HashAlg,
    error::ErrorClass,
    nv::Operation,
    session::{
        password_auth, AuthSession, AuthSlot, FileSessionStore, SessionRole, SessionSet,
        SessionStore, SessionType,
    },
    tpm::TPM_RS_PW,
    CliError,
};
use rstest::rstest;
use std::path::{Path, PathBuf};
use tempfile::tempdir;
use tpm2_protocol::data::{Tpm2bAuth, Tpm2bNonce, TpmaSession, TpmsAuthResponse};

const POLICY: u32 = 0x0300_0000;
const HMAC_A: u32 = 0x0200_0001;
const HMAC_B: u32 = 0x0200_0002;

fn paths(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}

#[rstest]
#[case(&[])]
#[case(&["a"])]
#[case(&["a", "b"])]
fn test_session_set_new(#[case] names: &[&str]) {
    let set = SessionSet::new(&paths(names)).unwrap();
    assert_eq!(set.auxiliary().len(), names.len());
    assert!(set.policy().is_none());
    assert!(set.hierarchy().is_none());
}

#[rstest]
fn test_session_set_too_many() {
    let err = SessionSet::new(&paths(&["a", "b", "c"])).unwrap_err();
    assert!(matches!(err, CliError::Usage(_)));
    assert_eq!(err.class(), ErrorClass::Configuration);
}

#[rstest]
#[case(&["a"], 0)]
#[case(&["a", "b"], 1)]
fn test_promote_policy(#[case] names: &[&str], #[case] remaining: usize) {
    let mut set = SessionSet::new(&paths(names)).unwrap();
    set.promote_policy().unwrap();

    let policy = set.policy().unwrap();
    assert_eq!(policy.path(), Path::new(names[0]));
    assert_eq!(policy.role(), SessionRole::Policy);
    assert_eq!(set.auxiliary().len(), remaining);
    assert_eq!(set.len(), names.len());
    if remaining == 1 {
        assert_eq!(set.auxiliary()[0].path(), Path::new(names[1]));
    }
}

#[rstest]
fn test_promote_policy_without_sessions() {
    let mut set = SessionSet::new(&[]).unwrap();
    let err = set.promote_policy().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Configuration);
    assert!(set.is_empty());
}

#[rstest]
fn test_check_policy_rejects_hmac() {
    let mut store =
        CountingStore::default().with("a", auth_session(HMAC_A, SessionType::Hmac, HashAlg::Sha256));
    let mut set = SessionSet::new(&paths(&["a"])).unwrap();
    set.promote_policy().unwrap();
    set.open(&mut store).unwrap();

    let err = set.check_policy().unwrap_err();
    assert!(matches!(err, CliError::Usage(_)));

    set.close_all(&mut store).unwrap();
    assert_eq!(store.closed, paths(&["a"]));
}

#[rstest]
fn test_phash_order() {
    let mut store = CountingStore::default()
        .with("h", auth_session(HMAC_A, SessionType::Hmac, HashAlg::Sha1))
        .with("p", auth_session(POLICY, SessionType::Policy, HashAlg::Sha256))
        .with("x", auth_session(HMAC_B, SessionType::Hmac, HashAlg::Sha384));

    let mut set = SessionSet::new(&paths(&["p", "x"])).unwrap();
    set.bind_hierarchy(PathBuf::from("h"));
    set.promote_policy().unwrap();
    set.open(&mut store).unwrap();

    let order = set.phash_order().map(|s| s.map(|s| s.handle));
    assert_eq!(order, [Some(HMAC_A), Some(POLICY), Some(HMAC_B)]);
    assert_eq!(store.opened, paths(&["h", "p", "x"]));

    let mut store2 = CountingStore::default()
        .with("x", auth_session(HMAC_B, SessionType::Hmac, HashAlg::Sha384))
        .with("y", auth_session(HMAC_A, SessionType::Hmac, HashAlg::Sha1));
    let mut set2 = SessionSet::new(&paths(&["x", "y"])).unwrap();
    set2.open(&mut store2).unwrap();
    let order = set2.phash_order().map(|s| s.map(|s| s.handle));
    assert_eq!(order, [None, Some(HMAC_B), Some(HMAC_A)]);
}

#[rstest]
#[case(Operation::Undefine, &["a", "b"], false, vec![AuthSlot::Hierarchy, AuthSlot::Auxiliary(0), AuthSlot::Auxiliary(1)])]
#[case(Operation::UndefineSpecial, &["a", "b"], true, vec![AuthSlot::Policy, AuthSlot::Hierarchy, AuthSlot::Auxiliary(0)])]
#[case(Operation::UndefineSpecial, &["a"], true, vec![AuthSlot::Policy, AuthSlot::Hierarchy])]
fn test_command_slots(
    #[case] operation: Operation,
    #[case] names: &[&str],
    #[case] promote: bool,
    #[case] expected: Vec<AuthSlot>,
) {
    let mut set = SessionSet::new(&paths(names)).unwrap();
    if promote {
        set.promote_policy().unwrap();
    }
    assert_eq!(set.command_slots(operation), expected);
}

#[rstest]
fn test_close_all_is_idempotent() {
    let mut store = CountingStore::default()
        .with("h", auth_session(HMAC_A, SessionType::Hmac, HashAlg::Sha256))
        .with("a", auth_session(HMAC_B, SessionType::Hmac, HashAlg::Sha256));
    let mut set = SessionSet::new(&paths(&["a"])).unwrap();
    set.bind_hierarchy(PathBuf::from("h"));
    set.open(&mut store).unwrap();

    set.close_all(&mut store).unwrap();
    assert_eq!(store.closed.len(), 2);
    set.close_all(&mut store).unwrap();
    assert_eq!(store.closed.len(), 2);
    assert!(set.auxiliary().iter().all(|slot| !slot.is_open()));
}

#[rstest]
fn test_close_all_continues_after_failure() {
    let mut store = CountingStore::default()
        .with("h", auth_session(HMAC_A, SessionType::Hmac, HashAlg::Sha256))
        .with("a", auth_session(HMAC_B, SessionType::Hmac, HashAlg::Sha256))
        .with("b", auth_session(0x0200_0003, SessionType::Hmac, HashAlg::Sha256));
    store.fail_close = paths(&["h", "b"]);

    let mut set = SessionSet::new(&paths(&["a", "b"])).unwrap();
    set.bind_hierarchy(PathBuf::from("h"));
    set.open(&mut store).unwrap();

    let err = set.close_all(&mut store).unwrap_err();
    assert!(matches!(&err, CliError::Teardown(path, _) if path == "h"));
    assert_eq!(err.class(), ErrorClass::Teardown);
    assert_eq!(store.closed, paths(&["h", "a", "b"]));

    set.close_all(&mut store).unwrap();
    assert_eq!(store.closed.len(), 3);
}

#[rstest]
fn test_open_failure_keeps_opened_slots_for_teardown() {
    let mut store = CountingStore::default()
        .with("h", auth_session(HMAC_A, SessionType::Hmac, HashAlg::Sha256));
    let mut set = SessionSet::new(&paths(&["missing", "never"])).unwrap();
    set.bind_hierarchy(PathBuf::from("h"));

    assert!(set.open(&mut store).is_err());
    assert_eq!(store.opened, paths(&["h"]));

    set.close_all(&mut store).unwrap();
    assert_eq!(store.closed, paths(&["h"]));
}

#[rstest]
fn test_file_store_round_trip() {
    let dir = tempdir().unwrap();
    let mut session = auth_session(POLICY, SessionType::Policy, HashAlg::Sha384);
    session.session_key = vec![0xaa, 0xbb];
    let path = save_session(dir.path(), "policy.json", &session);

    let mut store = FileSessionStore;
    let loaded = store.open(&path).unwrap();
    assert_eq!(loaded, session);

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(json["type"], "session");
    assert_eq!(json["data"]["session_type"], "policy");
    assert_eq!(json["data"]["auth_hash"], "sha384");
    assert_eq!(json["data"]["session_key"], "aabb");
}

#[rstest]
fn test_file_store_skips_consumed_session() {
    let dir = tempdir().unwrap();
    let session = auth_session(HMAC_A, SessionType::Hmac, HashAlg::Sha256);
    let path = save_session(dir.path(), "hmac.json", &session);

    let mut consumed = session.clone();
    consumed.nonce_tpm = vec![0x22; 32];
    consumed.consumed = true;
    FileSessionStore.close(&path, &consumed).unwrap();
    assert_eq!(AuthSession::load(&path).unwrap().nonce_tpm, session.nonce_tpm);

    consumed.consumed = false;
    FileSessionStore.close(&path, &consumed).unwrap();
    assert_eq!(AuthSession::load(&path).unwrap().nonce_tpm, vec![0x22; 32]);
}

#[rstest]
#[case(r#"{"version":1,"type":"key","data":{"handle":50331648,"session_type":"policy","auth_hash":"sha256","nonce_tpm":"","attributes":1}}"#)]
#[case(r#"{"version":2,"type":"session","data":{"handle":50331648,"session_type":"policy","auth_hash":"sha256","nonce_tpm":"","attributes":1}}"#)]
#[case(r#"{"version":1,"type":"session","data":{"handle":33554432,"session_type":"policy","auth_hash":"sha256","nonce_tpm":"","attributes":1}}"#)]
#[case(r#"{"version":1,"type":"session","data":{"handle":50331648,"session_type":"policy","auth_hash":"md5","nonce_tpm":"","attributes":1}}"#)]
#[case("not json")]
fn test_file_store_rejects_invalid(#[case] content: &str) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.json");
    std::fs::write(&path, content).unwrap();

    let err = FileSessionStore.open(&path).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Configuration, "{err}");
}

#[rstest]
fn test_authorize_policy_session_has_empty_hmac() {
    let mut session = auth_session(POLICY, SessionType::Policy, HashAlg::Sha256);
    let auth = session.authorize(&[0u8; 32], b"ignored").unwrap();
    assert_eq!(auth.session_handle.0, POLICY);
    assert!(auth.hmac.is_empty());
    assert_eq!(auth.nonce.to_vec().len(), 32);
    assert_eq!(auth.session_attributes, TpmaSession::CONTINUE_SESSION);
    assert_eq!(session.nonce_caller, auth.nonce.to_vec());
}

#[rstest]
fn test_authorize_hmac_ignores_trailing_zeros() {
    let mut session = auth_session(HMAC_A, SessionType::Hmac, HashAlg::Sha256);
    session.session_key = vec![0x42; 32];
    let cp_hash = HashAlg::Sha256.digest(&[b"command"]);
    let mut key = vec![0x42; 32];
    key.extend_from_slice(b"pw");

    for auth_value in [&b"pw"[..], &b"pw\0\0"[..]] {
        let auth = session.authorize(&cp_hash, auth_value).unwrap();
        let expected = HashAlg::Sha256
            .hmac(
                &key,
                &[
                    &cp_hash,
                    &auth.nonce.to_vec(),
                    &session.nonce_tpm,
                    &[auth.session_attributes.bits()],
                ],
            )
            .unwrap();
        assert_eq!(auth.hmac.to_vec(), expected);
    }
}

fn signed_response(
    session: &AuthSession,
    rp_hash: &[u8],
    auth_value: &[u8],
) -> TpmsAuthResponse {
    let nonce_tpm = vec![0x33; session.auth_hash.size()];
    let attributes = TpmaSession::CONTINUE_SESSION;
    let mut key = session.session_key.clone();
    key.extend_from_slice(auth_value);
    let hmac = session
        .auth_hash
        .hmac(
            &key,
            &[rp_hash, &nonce_tpm, &session.nonce_caller, &[attributes.bits()]],
        )
        .unwrap();
    TpmsAuthResponse {
        nonce: Tpm2bNonce::try_from(nonce_tpm.as_slice()).unwrap(),
        session_attributes: attributes,
        hmac: Tpm2bAuth::try_from(hmac.as_slice()).unwrap(),
    }
}

#[rstest]
fn test_refresh_verifies_response_hmac() {
    let mut session = auth_session(HMAC_A, SessionType::Hmac, HashAlg::Sha256);
    session.session_key = vec![0x42; 32];
    let rp_hash = HashAlg::Sha256.digest(&[b"response"]);
    session.authorize(&[0u8; 32], b"pw").unwrap();

    let response = signed_response(&session, &rp_hash, b"pw");
    session.refresh(&rp_hash, b"pw\0", &response).unwrap();
    assert_eq!(session.nonce_tpm, vec![0x33; 32]);
    assert!(!session.consumed);
}

#[rstest]
#[case::hmac(true, false)]
#[case::auth_value(false, true)]
fn test_refresh_rejects_tampered_response(
    #[case] flip_hmac: bool,
    #[case] wrong_auth: bool,
) {
    let mut session = auth_session(HMAC_A, SessionType::Hmac, HashAlg::Sha256);
    session.session_key = vec![0x42; 32];
    let rp_hash = HashAlg::Sha256.digest(&[b"response"]);
    session.authorize(&[0u8; 32], b"pw").unwrap();
    let nonce_before = session.nonce_tpm.clone();

    let mut response = signed_response(&session, &rp_hash, b"pw");
    if flip_hmac {
        let mut hmac = response.hmac.to_vec();
        hmac[0] ^= 0x80;
        response.hmac = Tpm2bAuth::try_from(hmac.as_slice()).unwrap();
    }
    let auth_value: &[u8] = if wrong_auth { b"other" } else { b"pw" };

    let err = session.refresh(&rp_hash, auth_value, &response).unwrap_err();
    assert!(matches!(err, CliError::Execution(_)));
    assert_eq!(session.nonce_tpm, nonce_before);
}

#[rstest]
fn test_refresh_policy_session_takes_nonce() {
    let mut session = auth_session(POLICY, SessionType::Policy, HashAlg::Sha256);
    session.attributes = 0;
    let response = TpmsAuthResponse {
        nonce: Tpm2bNonce::try_from(&[0x44; 32][..]).unwrap(),
        session_attributes: TpmaSession::empty(),
        hmac: Tpm2bAuth::default(),
    };
    session.refresh(&[0u8; 32], &[], &response).unwrap();
    assert_eq!(session.nonce_tpm, vec![0x44; 32]);
    assert!(session.consumed);
}

#[rstest]
fn test_password_auth() {
    let auth = password_auth(b"secret").unwrap();
    assert_eq!(auth.session_handle.0, TPM_RS_PW);
    assert!(auth.nonce.is_empty());
    assert_eq!(auth.session_attributes, TpmaSession::CONTINUE_SESSION);
    assert_eq!(auth.hmac.to_vec(), b"secret".to_vec());
}

#[rstest]
fn test_password_auth_too_long() {
    let err = password_auth(&[0x61; 1024]).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Configuration);
}
