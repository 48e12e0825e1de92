//! Restore round-trips and the asymmetric key split.

mod common;

use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::PermissionsExt;

use common::{assert_same_tree, Fixture, SET};
use magpie_core::config::RepoConfig;
use magpie_core::{CancelToken, Engine, Error};
use magpie_crypto::{Error as CryptoError, KdfParams, KeyRing, Keyfile};
use magpie_repo::Memory;

#[test]
fn round_trip_preserves_contents_structure_and_modes() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(tmp.path());
    // Small chunks so the big file exercises multi-blob reassembly.
    fx.engine.options_mut().chunk_size = 64;
    fx.engine.options_mut().min_chunkable = 128;

    fx.write("docs/nested/deep.txt", b"down here");
    fx.write("docs/readme", b"hello");
    fx.write("empty", b"");
    let big: Vec<u8> = (0..20_000u32).flat_map(|i| i.to_le_bytes()).collect();
    fx.write("big.bin", &big);
    // Filenames are bytes, not necessarily UTF-8.
    let odd = fx.root.join(OsString::from_vec(b"od\xffd-name".to_vec()));
    fs::write(&odd, b"odd").unwrap();

    fs::set_permissions(fx.root.join("docs/readme"), fs::Permissions::from_mode(0o600)).unwrap();
    fs::set_permissions(fx.root.join("docs"), fs::Permissions::from_mode(0o750)).unwrap();

    fx.scan_backup("full");

    let out = tmp.path().join("restored");
    let stats = fx
        .engine
        .restore("full", &out, &CancelToken::new())
        .unwrap();

    assert_same_tree(&fx.root, &out);
    assert_eq!(stats.files, 5);
    assert_eq!(stats.bytes, (big.len() + 9 + 5 + 3) as u64);
}

#[test]
fn unattended_keys_can_back_up_but_only_unlocked_keys_restore() {
    let tmp = tempfile::tempdir().unwrap();
    common::enable_logging();

    let generated = KeyRing::generate();
    let keyfile = Keyfile::seal(&generated, b"pw", KdfParams::fast_insecure()).unwrap();
    let repo = Memory::new();

    // The scheduler's side: no password, no private key.
    let unattended = Engine::init(
        repo.clone(),
        keyfile.unattended().unwrap(),
        &keyfile,
        RepoConfig::default(),
        tmp.path().join("cache.db"),
    )
    .unwrap();

    let root = tmp.path().join("set");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("file.txt"), b"unattended contents").unwrap();
    unattended.add_backup_set(SET, &root).unwrap();
    unattended.scan(SET, &CancelToken::new()).unwrap();
    unattended.backup(SET, "s1", &CancelToken::new()).unwrap();

    // Restore with the same (locked) keyring: refused before any I/O.
    let out = tmp.path().join("restored");
    let err = unattended
        .restore("s1", &out, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::Crypto(CryptoError::Locked)));

    // The operator's side: fetch the envelope from the repository, unlock
    // it with the password, and read everything back.
    let fetched = Engine::fetch_keyfile(&repo).unwrap();
    let unlocked = Engine::open(
        repo.clone(),
        fetched.unlock(b"pw").unwrap(),
        tmp.path().join("cache2.db"),
    )
    .unwrap();
    unlocked.restore("s1", &out, &CancelToken::new()).unwrap();
    assert_eq!(fs::read(out.join("file.txt")).unwrap(), b"unattended contents");
}

#[test]
fn restore_refuses_a_nonempty_target() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());
    fx.write("c.txt", b"bar");
    fx.scan_backup("s1");

    let out = tmp.path().join("occupied");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("existing"), b"x").unwrap();

    let err = fx.engine.restore("s1", &out, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::TargetNotEmpty(_)));
}

#[test]
fn restoring_an_unknown_snapshot_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());

    let err = fx
        .engine
        .restore("ghost", &tmp.path().join("out"), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::NoSuchSnapshot(_)));
}

#[test]
fn tampered_objects_fail_authentication() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());
    fx.write("c.txt", b"bar");
    fx.scan_backup("s1");

    // Flip one ciphertext byte of every stored object.
    for key in fx.repo.keys() {
        if key.starts_with("objects/") {
            fx.repo.corrupt(&key, |bytes| {
                let last = bytes.len() - 1;
                bytes[last] ^= 0x01;
            });
        }
    }

    let err = fx
        .engine
        .restore("s1", &tmp.path().join("out"), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::Crypto(CryptoError::AuthFail)));
}
