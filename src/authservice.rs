// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! Authenticated variables and the Secure Boot platform mode.
//!
//! Variables with the `AUTHENTICATED_WRITE_ACCESS` attribute are written with a counter based
//! authentication descriptor: an RSA-2048/SHA-256 signature over the payload and a monotonic
//! count that must increase with every write. The public key used for the first write is
//! recorded in the key database, and later writes must be signed with the same key.
//!
//! Variables with the `TIME_BASED_AUTHENTICATED_WRITE_ACCESS` attribute carry a PKCS#7 signature
//! over the name, GUID, attributes, timestamp and payload, which is verified against the
//! certificates in the platform key (PK) or the key exchange key database (KEK). The timestamp
//! must be later than the one of the previous write, unless data is being appended.
//!
//! The platform is in setup mode as long as no PK is enrolled. In setup mode, writes to PK, KEK
//! and the image security databases are not verified. Enrolling a PK switches to user mode, and
//! deleting it switches back.

use crate::status::*;
use crate::varformat::*;
use crate::variable::{Variable, VariableStorageInfo, VariableStore, EFI_GLOBAL_VARIABLE_GUID};
use crate::{guid, Guid};

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use log::{info, warn};
use sha2::{Digest, Sha256};
use widestring::{u16cstr, U16CStr, U16CString};

pub const EFI_IMAGE_SECURITY_DATABASE_GUID: Guid = guid!("d719b2cb-3d3a-4596-a3bc-dad00e67656f");

pub const EFI_CERT_RSA2048_GUID: Guid = guid!("3c5766e8-269c-4e34-aa14-ed776e85b3b6");
pub const EFI_CERT_RSA2048_SHA256_GUID: Guid = guid!("e2b36190-879b-4a3d-ad8d-f2e7bba32784");
pub const EFI_CERT_RSA2048_SHA1_GUID: Guid = guid!("67f8444f-8743-48f1-a328-1eaab8736080");
pub const EFI_CERT_X509_GUID: Guid = guid!("a5c059a1-94e4-4aa7-87b5-ab155c2bf072");

/// Certificate types of a WIN_CERTIFICATE_UEFI_GUID
pub const EFI_CERT_TYPE_RSA2048_SHA256_GUID: Guid = guid!("a7717414-c616-4977-9420-844712a735bf");
pub const EFI_CERT_TYPE_PKCS7_GUID: Guid = guid!("4aafd29d-68df-49ee-8aa9-347d375665a7");

pub const EFI_HASH_ALGORITHM_SHA256_GUID: Guid = guid!("c6bb8d2b-6f59-4b3c-9b0e-2f4a8f1bc7cf");

pub const WIN_CERT_TYPE_EFI_GUID: u16 = 0x0EF1;
pub const WIN_CERT_REVISION: u16 = 0x0200;

const PK: &U16CStr = u16cstr!("PK");
const KEK: &U16CStr = u16cstr!("KEK");
const DB: &U16CStr = u16cstr!("db");
const DBX: &U16CStr = u16cstr!("dbx");
const SETUP_MODE: &U16CStr = u16cstr!("SetupMode");
const SECURE_BOOT: &U16CStr = u16cstr!("SecureBoot");
const SIGNATURE_SUPPORT: &U16CStr = u16cstr!("SignatureSupport");
const KEY_DB: &U16CStr = u16cstr!("AuthVarKeyDatabase");

pub const RSA2048_KEY_SIZE: usize = 256;
const MAX_KEY_NUM: usize = 64;

/// WIN_CERTIFICATE_UEFI_GUID up to its certificate data
const WIN_CERT_UEFI_GUID_SIZE: usize = 8 + 16;

/// Size of an EFI_VARIABLE_AUTHENTICATION descriptor
pub const AUTHINFO_SIZE: usize = 8 + WIN_CERT_UEFI_GUID_SIZE + 16 + 2 * RSA2048_KEY_SIZE;

const SIGNATURE_LIST_HEADER_SIZE: usize = 28;

const NV_BS_RT: u32 =
    EFI_VARIABLE_NON_VOLATILE | EFI_VARIABLE_BOOTSERVICE_ACCESS | EFI_VARIABLE_RUNTIME_ACCESS;
const BS_RT: u32 = EFI_VARIABLE_BOOTSERVICE_ACCESS | EFI_VARIABLE_RUNTIME_ACCESS;
const AUTH: u32 = EFI_VARIABLE_AUTHENTICATED_WRITE_ACCESS;
const TIME_AUTH: u32 = EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS;

/// Cryptographic primitives used to authenticate variable updates
pub trait SignatureVerifier {
    /// Verifies a PKCS#1 v1.5 signature of `digest` with the RSA-2048 public modulus
    /// `public_key` and public exponent 0x10001.
    fn verify_rsa2048_sha256(&self, public_key: &[u8], digest: &[u8; 32], signature: &[u8])
        -> bool;

    /// Verifies PKCS#7 SignedData `signed_data` over `data`, chaining up to the X.509
    /// certificate `trusted_cert`.
    fn verify_pkcs7(&self, signed_data: &[u8], trusted_cert: &[u8], data: &[u8]) -> bool;
}

/// A verifier that rejects all signatures, for platforms without Secure Boot
pub struct NullVerifier;

impl SignatureVerifier for NullVerifier {
    fn verify_rsa2048_sha256(&self, _: &[u8], _: &[u8; 32], _: &[u8]) -> bool {
        false
    }

    fn verify_pkcs7(&self, _: &[u8], _: &[u8], _: &[u8]) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PlatformMode {
    User = 0,
    Setup = 1,
}

fn rd16(b: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([b[o], b[o + 1]])
}

fn rd32(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]])
}

/// EFI_VARIABLE_AUTHENTICATION
struct CounterAuth<'a> {
    monotonic_count: u64,
    public_key: &'a [u8],
    signature: &'a [u8],
    payload: &'a [u8],
}

impl<'a> CounterAuth<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, Status> {
        if data.len() < AUTHINFO_SIZE {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        if rd16(data, 14) != WIN_CERT_TYPE_EFI_GUID
            || Guid::from_bytes(&data[16..]) != Some(EFI_CERT_TYPE_RSA2048_SHA256_GUID)
        {
            return Err(Status::EFI_SECURITY_VIOLATION);
        }
        let key = 8 + WIN_CERT_UEFI_GUID_SIZE + 16;
        let mut count = [0u8; 8];
        count.copy_from_slice(&data[..8]);
        Ok(CounterAuth {
            monotonic_count: u64::from_le_bytes(count),
            public_key: &data[key..key + RSA2048_KEY_SIZE],
            signature: &data[key + RSA2048_KEY_SIZE..AUTHINFO_SIZE],
            payload: &data[AUTHINFO_SIZE..],
        })
    }

    fn digest(&self) -> [u8; 32] {
        Sha256::new()
            .chain_update(self.payload)
            .chain_update(self.monotonic_count.to_le_bytes())
            .finalize()
            .into()
    }
}

/// EFI_VARIABLE_AUTHENTICATION_2
struct TimeAuth<'a> {
    timestamp: EfiTime,
    signed_data: &'a [u8],
    payload: &'a [u8],
}

impl<'a> TimeAuth<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, Status> {
        let cert = EfiTime::SIZE;
        if data.len() < cert + WIN_CERT_UEFI_GUID_SIZE {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        let len = rd32(data, cert) as usize;
        if len < WIN_CERT_UEFI_GUID_SIZE || data.len() < cert + len {
            return Err(Status::EFI_SECURITY_VIOLATION);
        }
        if rd16(data, cert + 6) != WIN_CERT_TYPE_EFI_GUID
            || Guid::from_bytes(&data[cert + 8..]) != Some(EFI_CERT_TYPE_PKCS7_GUID)
        {
            return Err(Status::EFI_SECURITY_VIOLATION);
        }
        Ok(TimeAuth {
            timestamp: EfiTime::from_bytes(data).unwrap_or_default(),
            signed_data: &data[cert + WIN_CERT_UEFI_GUID_SIZE..cert + len],
            payload: &data[cert + len..],
        })
    }
}

/// The data covered by the signature of a time based authenticated write
pub fn time_based_signed_data(
    name: &U16CStr,
    guid: &Guid,
    attributes: u32,
    timestamp: &EfiTime,
    payload: &[u8],
) -> Vec<u8> {
    let mut v: Vec<u8> = name.as_slice().iter().flat_map(|c| c.to_le_bytes()).collect();
    v.extend_from_slice(&guid.to_bytes());
    v.extend_from_slice(&attributes.to_le_bytes());
    v.extend_from_slice(&timestamp.to_bytes());
    v.extend_from_slice(payload);
    v
}

/// Returns the signature data, without the owner GUID, of all entries of type `sig_type` in
/// the EFI_SIGNATURE_LIST array `data`.
pub fn signatures<'a>(data: &'a [u8], sig_type: &Guid) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut rest = data;
    while rest.len() >= SIGNATURE_LIST_HEADER_SIZE {
        let list_size = rd32(rest, 16) as usize;
        let header_size = rd32(rest, 20) as usize;
        let sig_size = rd32(rest, 24) as usize;
        let entries = SIGNATURE_LIST_HEADER_SIZE + header_size;
        if list_size > rest.len() || list_size < entries || sig_size <= 16 {
            warn!("Malformed signature list\n");
            break;
        }
        if Guid::from_bytes(rest) == Some(*sig_type) {
            out.extend(
                rest[entries..list_size]
                    .chunks_exact(sig_size)
                    .map(|e| &e[16..]),
            );
        }
        rest = &rest[list_size..];
    }
    out
}

/// Serializes an EFI_SIGNATURE_LIST of type `sig_type` holding `entries`, all owned by `owner`.
/// The entries must all have the same size.
pub fn signature_list(sig_type: &Guid, owner: &Guid, entries: &[&[u8]]) -> Vec<u8> {
    let sig_size = 16 + entries.first().map_or(0, |e| e.len());
    let list_size = SIGNATURE_LIST_HEADER_SIZE + entries.len() * sig_size;
    let mut v = Vec::with_capacity(list_size);
    v.extend_from_slice(&sig_type.to_bytes());
    v.extend_from_slice(&(list_size as u32).to_le_bytes());
    v.extend_from_slice(&0u32.to_le_bytes());
    v.extend_from_slice(&(sig_size as u32).to_le_bytes());
    for e in entries {
        v.extend_from_slice(&owner.to_bytes());
        v.extend_from_slice(e);
    }
    v
}

/// Which certificates a time based authenticated write is verified against
#[derive(Clone, Copy, PartialEq, Eq)]
enum Trust {
    Pk,
    Kek,
    KekOrPk,
}

/// The variable services, with authenticated writes verified before they reach the store
pub struct AuthVariableService {
    store: VariableStore,
    verifier: Box<dyn SignatureVerifier>,
    // concatenated RSA-2048 public keys, indexed from 1
    keys: RefCell<Vec<u8>>,
    mode: Cell<PlatformMode>,
}

impl AuthVariableService {
    /// Wraps `store`, loading the public key database and deriving the platform mode from the
    /// presence of a PK. If `force_clear_pk` is set, the PK is deleted and the platform enters
    /// setup mode.
    pub fn new(
        store: VariableStore,
        verifier: Box<dyn SignatureVerifier>,
        force_clear_pk: bool,
    ) -> Result<Self, Status> {
        let service = AuthVariableService {
            store,
            verifier,
            keys: RefCell::new(Vec::new()),
            mode: Cell::new(PlatformMode::Setup),
        };
        let auth_guid = &EFI_AUTHENTICATED_VARIABLE_GUID;
        let global = &EFI_GLOBAL_VARIABLE_GUID;
        let none = AuthFields::default();

        match service.find(KEY_DB, auth_guid)? {
            Some(v) => {
                let n = v.data.len() / RSA2048_KEY_SIZE * RSA2048_KEY_SIZE;
                *service.keys.borrow_mut() = v.data[..n].to_vec();
            }
            None => {
                service
                    .store
                    .update_variable(KEY_DB, auth_guid, &[0], NV_BS_RT | AUTH, &none)?
            }
        }

        if service.find(SIGNATURE_SUPPORT, global)?.is_none() {
            let support: Vec<u8> = [EFI_CERT_RSA2048_SHA256_GUID, EFI_CERT_RSA2048_SHA1_GUID]
                .iter()
                .flat_map(|g| g.to_bytes())
                .collect();
            service
                .store
                .update_variable(SIGNATURE_SUPPORT, global, &support, BS_RT | AUTH, &none)?;
        }

        let mut mode = match service.find(PK, global)? {
            Some(_) => PlatformMode::User,
            None => PlatformMode::Setup,
        };
        if force_clear_pk && mode == PlatformMode::User {
            warn!("Clearing the platform key\n");
            service
                .store
                .update_variable(PK, global, &[], NV_BS_RT | AUTH, &none)?;
            mode = PlatformMode::Setup;
        }
        service.set_platform_mode(mode)?;
        Ok(service)
    }

    /// The underlying variable store
    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn platform_mode(&self) -> PlatformMode {
        self.mode.get()
    }

    /// The number of public keys in the key database
    pub fn key_count(&self) -> usize {
        self.keys.borrow().len() / RSA2048_KEY_SIZE
    }

    pub fn get_variable(&self, name: &U16CStr, guid: &Guid) -> Result<(u32, Vec<u8>), Status> {
        self.store.get_variable(name, guid)
    }

    pub fn get_next_variable_name(
        &self,
        name: &U16CStr,
        guid: &Guid,
    ) -> Result<(U16CString, Guid), Status> {
        self.store.get_next_variable_name(name, guid)
    }

    pub fn query_variable_info(&self, attributes: u32) -> Result<VariableStorageInfo, Status> {
        self.store.query_variable_info(attributes)
    }

    fn find(&self, name: &U16CStr, guid: &Guid) -> Result<Option<Variable>, Status> {
        match self.store.find_variable(name, Some(guid)) {
            Ok(v) => Ok(Some(v)),
            Err(Status::EFI_NOT_FOUND) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set_platform_mode(&self, mode: PlatformMode) -> Result<(), Status> {
        if mode != self.mode.get() {
            info!("Platform mode {:?} -> {:?}\n", self.mode.get(), mode);
        }
        self.mode.set(mode);
        let global = &EFI_GLOBAL_VARIABLE_GUID;
        let none = AuthFields::default();
        let secure_boot = (mode == PlatformMode::User) as u8;
        self.store
            .update_variable(SETUP_MODE, global, &[mode as u8], BS_RT | AUTH, &none)?;
        self.store
            .update_variable(SECURE_BOOT, global, &[secure_boot], BS_RT | AUTH, &none)
    }

    /// SetVariable: writes to authenticated variables are verified, and writes to variables
    /// maintained by the firmware itself are refused.
    pub fn set_variable(
        &self,
        name: &U16CStr,
        guid: &Guid,
        attributes: u32,
        data: &[u8],
    ) -> Result<(), Status> {
        if attributes & (AUTH | TIME_AUTH) == AUTH | TIME_AUTH {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        let payload_size = if attributes & AUTH != 0 {
            CounterAuth::parse(data)?.payload.len()
        } else if attributes & TIME_AUTH != 0 {
            TimeAuth::parse(data)?.payload.len()
        } else {
            data.len()
        };
        self.store
            .check_set_parameters(name, attributes, payload_size)?;

        let global = *guid == EFI_GLOBAL_VARIABLE_GUID;
        if (global && [SETUP_MODE, SECURE_BOOT, SIGNATURE_SUPPORT].contains(&name))
            || (*guid == EFI_AUTHENTICATED_VARIABLE_GUID && name == KEY_DB)
        {
            return Err(Status::EFI_WRITE_PROTECTED);
        }

        let existing = self.find(name, guid)?;
        let result = if global && name == PK {
            self.process_with_pk(name, guid, data, attributes, existing, true)
        } else if global && name == KEK {
            self.process_with_pk(name, guid, data, attributes, existing, false)
        } else if *guid == EFI_IMAGE_SECURITY_DATABASE_GUID && (name == DB || name == DBX) {
            self.process_with_kek(name, guid, data, attributes, existing)
        } else {
            self.process_variable(name, guid, data, attributes, existing)
        };
        if let Err(e) = result {
            if e == Status::EFI_SECURITY_VIOLATION {
                warn!(
                    "Authenticated write to {} rejected\n",
                    name.to_string_lossy()
                );
            }
        }
        result
    }

    /// Writes the payload of an authenticated write without verifying it, as done in setup mode
    fn write_unverified(
        &self,
        name: &U16CStr,
        guid: &Guid,
        data: &[u8],
        attributes: u32,
    ) -> Result<bool, Status> {
        let (payload, fields) = if attributes & AUTH != 0 {
            let a = CounterAuth::parse(data)?;
            let f = AuthFields {
                monotonic_count: a.monotonic_count,
                ..Default::default()
            };
            (a.payload, f)
        } else if attributes & TIME_AUTH != 0 {
            let a = TimeAuth::parse(data)?;
            let f = AuthFields {
                timestamp: a.timestamp,
                ..Default::default()
            };
            (a.payload, f)
        } else {
            (data, AuthFields::default())
        };
        self.store
            .update_variable(name, guid, payload, attributes, &fields)?;
        Ok(!payload.is_empty())
    }

    fn process_with_pk(
        &self,
        name: &U16CStr,
        guid: &Guid,
        data: &[u8],
        attributes: u32,
        existing: Option<Variable>,
        is_pk: bool,
    ) -> Result<(), Status> {
        if attributes & EFI_VARIABLE_NON_VOLATILE == 0 {
            return Err(Status::EFI_INVALID_PARAMETER);
        }

        if self.mode.get() == PlatformMode::Setup {
            let enrolled = self.write_unverified(name, guid, data, attributes)?;
            if enrolled && is_pk {
                self.set_platform_mode(PlatformMode::User)?;
            }
            return Ok(());
        }

        let deleted = if attributes & TIME_AUTH != 0 {
            self.verify_time_based(name, guid, data, attributes, existing.as_ref(), Trust::Pk)?
        } else if attributes & AUTH != 0 {
            let auth = CounterAuth::parse(data)?;
            if existing
                .as_ref()
                .map_or(false, |v| auth.monotonic_count <= v.auth.monotonic_count)
            {
                return Err(Status::EFI_SECURITY_VIOLATION);
            }
            let pk = self
                .find(PK, &EFI_GLOBAL_VARIABLE_GUID)?
                .ok_or(Status::EFI_SECURITY_VIOLATION)?;
            let keys = signatures(&pk.data, &EFI_CERT_RSA2048_GUID);
            let key = keys.first().ok_or(Status::EFI_SECURITY_VIOLATION)?;
            self.verify_counter_based(&auth, key)?;
            let fields = AuthFields {
                monotonic_count: auth.monotonic_count,
                ..Default::default()
            };
            self.store
                .update_variable(name, guid, auth.payload, attributes, &fields)?;
            auth.payload.is_empty()
        } else {
            return Err(Status::EFI_INVALID_PARAMETER);
        };

        if deleted && is_pk {
            self.set_platform_mode(PlatformMode::Setup)?;
        }
        Ok(())
    }

    fn process_with_kek(
        &self,
        name: &U16CStr,
        guid: &Guid,
        data: &[u8],
        attributes: u32,
        existing: Option<Variable>,
    ) -> Result<(), Status> {
        if self.mode.get() == PlatformMode::Setup {
            return self
                .write_unverified(name, guid, data, attributes)
                .map(|_| ());
        }

        if attributes & TIME_AUTH != 0 {
            let trust = Trust::KekOrPk;
            self.verify_time_based(name, guid, data, attributes, existing.as_ref(), trust)?;
            return Ok(());
        }
        if attributes & AUTH == 0 {
            return Err(Status::EFI_INVALID_PARAMETER);
        }

        let auth = CounterAuth::parse(data)?;
        if existing
            .as_ref()
            .map_or(false, |v| auth.monotonic_count <= v.auth.monotonic_count)
        {
            return Err(Status::EFI_SECURITY_VIOLATION);
        }
        let kek = self
            .find(KEK, &EFI_GLOBAL_VARIABLE_GUID)?
            .ok_or(Status::EFI_SECURITY_VIOLATION)?;
        if !signatures(&kek.data, &EFI_CERT_RSA2048_GUID)
            .iter()
            .any(|k| k.get(..RSA2048_KEY_SIZE) == Some(auth.public_key))
        {
            return Err(Status::EFI_SECURITY_VIOLATION);
        }
        self.verify_counter_based(&auth, auth.public_key)?;
        let fields = AuthFields {
            monotonic_count: auth.monotonic_count,
            ..Default::default()
        };
        self.store
            .update_variable(name, guid, auth.payload, attributes, &fields)
    }

    fn process_variable(
        &self,
        name: &U16CStr,
        guid: &Guid,
        data: &[u8],
        attributes: u32,
        existing: Option<Variable>,
    ) -> Result<(), Status> {
        if attributes & TIME_AUTH != 0 {
            let trust = Trust::Kek;
            self.verify_time_based(name, guid, data, attributes, existing.as_ref(), trust)?;
            return Ok(());
        }

        let protected = existing
            .as_ref()
            .map_or(false, |v| v.attributes & (AUTH | TIME_AUTH) != 0);
        if attributes & AUTH == 0 {
            if protected {
                return Err(Status::EFI_WRITE_PROTECTED);
            }
            let none = AuthFields::default();
            return self
                .store
                .update_variable(name, guid, data, attributes, &none);
        }

        let auth = CounterAuth::parse(data)?;
        let first_use = existing.as_ref().map_or(true, |v| v.attributes & AUTH == 0);
        let mut key_index = 0;
        if let Some(v) = existing.as_ref().filter(|_| !first_use) {
            key_index = v.auth.pubkey_index;
            if self.key(key_index).as_deref() != Some(auth.public_key) {
                return Err(Status::EFI_SECURITY_VIOLATION);
            }
            if auth.monotonic_count <= v.auth.monotonic_count {
                return Err(Status::EFI_SECURITY_VIOLATION);
            }
        }
        self.verify_counter_based(&auth, auth.public_key)?;

        if first_use && !auth.payload.is_empty() {
            key_index = self.add_key(auth.public_key)?;
        }
        let fields = AuthFields {
            monotonic_count: auth.monotonic_count,
            pubkey_index: key_index,
            ..Default::default()
        };
        self.store
            .update_variable(name, guid, auth.payload, attributes, &fields)
    }

    fn verify_counter_based(&self, auth: &CounterAuth, public_key: &[u8]) -> Result<(), Status> {
        let digest = auth.digest();
        if !self
            .verifier
            .verify_rsa2048_sha256(public_key, &digest, auth.signature)
        {
            return Err(Status::EFI_SECURITY_VIOLATION);
        }
        Ok(())
    }

    /// Verifies a time based authenticated write and performs it. Returns whether the write
    /// deleted the variable.
    fn verify_time_based(
        &self,
        name: &U16CStr,
        guid: &Guid,
        data: &[u8],
        attributes: u32,
        existing: Option<&Variable>,
        trust: Trust,
    ) -> Result<bool, Status> {
        let auth = TimeAuth::parse(data)?;
        if let Some(v) = existing {
            if attributes & EFI_VARIABLE_APPEND_WRITE == 0
                && !auth.timestamp.is_later_than(&v.auth.timestamp)
            {
                return Err(Status::EFI_SECURITY_VIOLATION);
            }
        }

        let signed = time_based_signed_data(name, guid, attributes, &auth.timestamp, auth.payload);
        let global = &EFI_GLOBAL_VARIABLE_GUID;
        let mut certs = Vec::new();
        if trust != Trust::Pk {
            certs.extend(self.find(KEK, global)?.map(|v| v.data));
        }
        if trust != Trust::Kek {
            certs.extend(self.find(PK, global)?.map(|v| v.data));
        }
        let verified = certs.iter().any(|list| {
            signatures(list, &EFI_CERT_X509_GUID)
                .iter()
                .any(|cert| self.verifier.verify_pkcs7(auth.signed_data, cert, &signed))
        });
        if !verified {
            return Err(Status::EFI_SECURITY_VIOLATION);
        }

        let fields = AuthFields {
            timestamp: auth.timestamp,
            ..Default::default()
        };
        self.store
            .update_variable(name, guid, auth.payload, attributes, &fields)?;
        Ok(auth.payload.is_empty())
    }

    fn key(&self, index: u32) -> Option<Vec<u8>> {
        let i = (index as usize).checked_sub(1)?;
        self.keys
            .borrow()
            .chunks_exact(RSA2048_KEY_SIZE)
            .nth(i)
            .map(<[u8]>::to_vec)
    }

    /// Adds `key` to the key database if it is not there yet, and returns its index
    fn add_key(&self, key: &[u8]) -> Result<u32, Status> {
        let mut keys = self.keys.borrow_mut();
        if let Some(i) = keys.chunks_exact(RSA2048_KEY_SIZE).position(|k| k == key) {
            return Ok(i as u32 + 1);
        }
        if keys.len() / RSA2048_KEY_SIZE >= MAX_KEY_NUM {
            warn!("Public key database is full\n");
            return Err(Status::EFI_OUT_OF_RESOURCES);
        }
        keys.extend_from_slice(key);
        let none = AuthFields::default();
        let auth_guid = &EFI_AUTHENTICATED_VARIABLE_GUID;
        if let Err(e) = self
            .store
            .update_variable(KEY_DB, auth_guid, &keys, NV_BS_RT | AUTH, &none)
        {
            let len = keys.len() - RSA2048_KEY_SIZE;
            keys.truncate(len);
            return Err(e);
        }
        Ok((keys.len() / RSA2048_KEY_SIZE) as u32)
    }
}
