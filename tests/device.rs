// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

mod common;

use common::{nv_public, NV_INDEX};
use nvundefine::{
    crypto::HashAlg,
    device::TpmDeviceError,
    error::ErrorClass,
    mocktpm::MockTpm,
    nv::{nv_name, probe},
    CliError,
};
use rstest::rstest;
use tpm2_protocol::data::{TpmCc, TpmRc, TpmRcBase, TpmaNv};

#[rstest]
fn test_nv_read_public() {
    let tpm = MockTpm::new();
    let public = nv_public(TpmaNv::POLICY_DELETE, &[0x01; 32]);
    tpm.define_nv(NV_INDEX, public.clone());
    let mut device = tpm.device();

    let (read, name) = device.nv_read_public(NV_INDEX).unwrap();
    assert_eq!(read.attributes, public.attributes);
    assert_eq!(read.auth_policy.to_vec(), vec![0x01; 32]);
    assert_eq!(read.data_size, 32);
    assert_eq!(name, nv_name(&public).unwrap());
    assert_eq!(
        &name[..2],
        &(HashAlg::Sha256.alg_id() as u16).to_be_bytes()
    );
    assert_eq!(name.len(), 34);
}

#[rstest]
fn test_read_attributes() {
    let tpm = MockTpm::new();
    tpm.define_nv(NV_INDEX, nv_public(TpmaNv::PLATFORMCREATE, &[]));
    let mut device = tpm.device();

    let descriptor = probe(&mut device, NV_INDEX).unwrap();
    assert_eq!(descriptor.index(), NV_INDEX);
    assert!(descriptor.attributes().contains(TpmaNv::PLATFORMCREATE));
    assert_eq!(tpm.calls(), vec![TpmCc::NvReadPublic]);
}

#[rstest]
fn test_name_covers_public_area() {
    let tpm = MockTpm::new();
    let mut public = nv_public(TpmaNv::empty(), &[]);
    tpm.define_nv(NV_INDEX, public.clone());
    let mut device = tpm.device();
    let descriptor = probe(&mut device, NV_INDEX).unwrap();
    assert_eq!(descriptor.name, nv_name(&public).unwrap());

    public.data_size = 64;
    assert_ne!(nv_name(&public).unwrap(), descriptor.name);
}

#[rstest]
fn test_nv_read_public_missing() {
    let tpm = MockTpm::new();
    let mut device = tpm.device();

    match device.nv_read_public(NV_INDEX) {
        Err(TpmDeviceError::TpmRc(rc)) => {
            assert_eq!(rc, TpmRc::from(TpmRcBase::Handle));
            assert!(!rc.is_warning());
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[rstest]
#[case::failure(0x0101)]
#[case::auth_unavailable(0x012f)]
#[case::lockout(0x0921)]
#[case::retry(0x0922)]
fn test_read_public_failure(#[case] raw: u32) {
    let tpm = MockTpm::new();
    tpm.define_nv(NV_INDEX, nv_public(TpmaNv::empty(), &[]));
    tpm.fail_command(TpmCc::NvReadPublic, TpmRc::try_from(raw).unwrap());
    let mut device = tpm.device();

    let err = probe(&mut device, NV_INDEX).unwrap_err();
    assert!(matches!(err, CliError::Tpm { step: "NV_ReadPublic", .. }));
    assert_eq!(err.class(), ErrorClass::Anchor);
    assert_eq!(err.exit_code(), 3);
}

#[rstest]
#[case::lockout(0x0921)]
#[case::retry(0x0922)]
#[case::yielded(0x0908)]
fn test_warning_is_error(#[case] raw: u32) {
    let tpm = MockTpm::new();
    tpm.define_nv(NV_INDEX, nv_public(TpmaNv::empty(), &[]));
    tpm.fail_command(TpmCc::NvReadPublic, TpmRc::try_from(raw).unwrap());
    let mut device = tpm.device();

    match device.nv_read_public(NV_INDEX) {
        Err(TpmDeviceError::TpmRc(rc)) => assert!(rc.is_warning()),
        other => panic!("warning accepted as success: {other:?}"),
    }
}

#[rstest]
fn test_read_public_transport_failure() {
    let tpm = MockTpm::new();
    tpm.break_transport(TpmCc::NvReadPublic);
    let mut device = tpm.device();

    let err = probe(&mut device, NV_INDEX).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transport);
}
