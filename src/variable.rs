// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! The EFI variable store.
//!
//! Variables live in two stores with the same layout: a volatile store in RAM, and a
//! non-volatile store in a firmware volume on flash. Both are append-only logs of variable
//! records (see [`crate::varformat`]); a variable is updated by appending a new record and
//! retiring the old one via its state byte, and the space taken up by retired records is
//! recovered by reclaiming the store, i.e., rewriting it with only the live records.
//!
//! Updates to the non-volatile store are ordered so that a power failure at any point leaves a
//! store that yields either the old or the new value of the variable being written:
//! - the old record is marked `IN_DELETED_TRANSITION`, which still makes it visible when no
//!   `ADDED` record exists;
//! - the new record is programmed as a header with an erased state, then marked
//!   `HEADER_VALID_ONLY`, then its name and data are programmed, and then it is marked `ADDED`;
//! - the old record is marked `DELETED`.
//!
//! The store keeps a mirror of both stores in memory. The non-volatile mirror is refreshed from
//! flash after every write. A call that arrives while another one is in progress, e.g., from a
//! flash driver callback, does not wait for it: it rescans the live stores for the last written
//! offsets and proceeds on a private mirror, and the interrupted call's mirror is
//! resynchronized on the next call.

use crate::fvb::{FaultTolerantWrite, FirmwareVolumeBlock};
use crate::status::*;
use crate::varformat::*;
use crate::varlang::LangState;
use crate::{guid, Guid, Lba};

use alloc::borrow::Cow;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell, RefMut};
use core::ops::{Deref, DerefMut};
use core::ops::Range;

use const_utf16::encode as utf16;
use log::{debug, warn};
use widestring::{U16CStr, U16CString};

pub const EFI_GLOBAL_VARIABLE_GUID: Guid = guid!("8be4df61-93ca-11d2-aa0d-00e098032b8c");

const HW_ERR_REC_PREFIX: &[u16] = utf16!("HwErrRec");

const NV_HWERR: u32 = EFI_VARIABLE_NON_VOLATILE | EFI_VARIABLE_HARDWARE_ERROR_RECORD;
const ACCESS: u32 = EFI_VARIABLE_BOOTSERVICE_ACCESS | EFI_VARIABLE_RUNTIME_ACCESS;

/// Sizes and limits of the variable stores
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariableConfig {
    /// Maximum size of a variable record (header, name and data), hardware error records
    /// excepted
    pub max_variable_size: usize,
    /// Maximum size of a hardware error record
    pub max_hardware_error_variable_size: usize,
    /// Part of the non-volatile store set aside for hardware error records
    pub hw_err_storage_size: usize,
    pub volatile_store_size: usize,
    /// Maximum size of the data of a variable that is grown by appending writes
    pub max_append_variable_size: usize,
}

impl Default for VariableConfig {
    fn default() -> Self {
        VariableConfig {
            max_variable_size: 0x400,
            max_hardware_error_variable_size: 0x8000,
            hw_err_storage_size: 0,
            volatile_store_size: 0x10000,
            max_append_variable_size: 0x2000,
        }
    }
}

/// Access statistics of a single variable
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableInfoEntry {
    pub guid: Guid,
    pub name: U16CString,
    pub volatile: bool,
    pub read_count: u32,
    pub write_count: u32,
    pub delete_count: u32,
}

/// Designates a record in one of the two stores
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariablePointerTrack {
    pub volatile: bool,
    pub record: VariableRecord,
}

/// A copy of a variable record as found in one of the stores
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    pub name: U16CString,
    pub guid: Guid,
    pub attributes: u32,
    pub data: Vec<u8>,
    pub auth: AuthFields,
    pub state: u8,
    pub volatile: bool,
}

/// The result of QueryVariableInfo
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariableStorageInfo {
    pub maximum_variable_storage_size: u64,
    pub remaining_variable_storage_size: u64,
    pub maximum_variable_size: u64,
}

struct StoreState {
    volatile: Vec<u8>,
    // mirror of the volume from the start of the variable store to its end
    nv: Vec<u8>,
    // offset of the variable store into the volume
    nv_base: usize,
    block_map: Vec<(u32, u32)>,
    fv_length: usize,

    volatile_last: usize,
    nv_last: usize,
    common_total: usize,
    hwerr_total: usize,
}

impl StoreState {
    fn store(&self, volatile: bool) -> &[u8] {
        if volatile {
            &self.volatile
        } else {
            &self.nv
        }
    }

    fn last(&self, volatile: bool) -> usize {
        if volatile {
            self.volatile_last
        } else {
            self.nv_last
        }
    }
}

/// The store state taken by a call: the shared mirror, or a private one for a re-entrant call
enum StoreGuard<'a> {
    Shared(RefMut<'a, StoreState>),
    Private(Box<StoreState>),
}

impl Deref for StoreGuard<'_> {
    type Target = StoreState;

    fn deref(&self) -> &StoreState {
        match self {
            StoreGuard::Shared(st) => st,
            StoreGuard::Private(st) => st,
        }
    }
}

impl DerefMut for StoreGuard<'_> {
    fn deref_mut(&mut self) -> &mut StoreState {
        match self {
            StoreGuard::Shared(st) => st,
            StoreGuard::Private(st) => st,
        }
    }
}

/// Splits the range `start..start + len` of the volume along its block map, and calls `f` with
/// the block, the offset into that block and the range of the input that it covers.
fn for_each_block(
    block_map: &[(u32, u32)],
    start: usize,
    len: usize,
    mut f: impl FnMut(Lba, usize, Range<usize>) -> Result<(), Status>,
) -> Result<(), Status> {
    let mut lba: Lba = 0;
    let mut base = 0;
    let mut done = 0;
    for &(num, size) in block_map {
        for _ in 0..num {
            let end = base + size as usize;
            let pos = start + done;
            if done < len && pos >= base && pos < end {
                let n = (end - pos).min(len - done);
                f(lba, pos - base, done..done + n)?;
                done += n;
            }
            base = end;
            lba += 1;
        }
    }
    if done < len {
        return Err(Status::EFI_INVALID_PARAMETER);
    }
    Ok(())
}

/// The block and the offset into it of the volume offset `linear`
fn locate(block_map: &[(u32, u32)], linear: usize) -> Option<(Lba, usize)> {
    let mut lba: Lba = 0;
    let mut base = 0;
    for &(num, size) in block_map {
        let size = size as usize;
        let span = num as usize * size;
        if size > 0 && linear < base + span {
            let index = (linear - base) / size;
            return Some((lba + index as Lba, linear - base - index * size));
        }
        base += span;
        lba += num as Lba;
    }
    None
}

fn read_volume(fvb: &dyn FirmwareVolumeBlock) -> Result<(FirmwareVolumeHeader, Vec<u8>), Status> {
    let (block_size, _) = fvb.get_block_size(0)?;
    let mut first = alloc::vec![0u8; block_size];
    fvb.read(0, 0, &mut first)?;
    let Some(fvh) = FirmwareVolumeHeader::parse(&first) else {
        warn!("Variable volume has no valid firmware volume header\n");
        return Err(Status::EFI_VOLUME_CORRUPTED);
    };
    let base = fvh.header_length as usize;
    let len = fvh.fv_length as usize;
    if base + STORE_HEADER_SIZE > len {
        return Err(Status::EFI_VOLUME_CORRUPTED);
    }
    let mut nv = alloc::vec![0u8; len - base];
    for_each_block(&fvh.block_map, base, nv.len(), |lba, offset, r| {
        fvb.read(lba, offset, &mut nv[r])
    })?;
    Ok((fvh, nv))
}

pub struct VariableStore {
    config: VariableConfig,
    fvb: Box<dyn FirmwareVolumeBlock>,
    ftw: Box<dyn FaultTolerantWrite>,
    state: RefCell<StoreState>,
    // the volatile store itself, of which the state holds a mirror
    live_volatile: RefCell<Vec<u8>>,
    lang: RefCell<LangState>,
    at_runtime: Cell<bool>,
    // set when the cached offsets may no longer match the stores
    resync: Cell<bool>,
    info: RefCell<BTreeMap<(Guid, Vec<u16>), VariableInfoEntry>>,
}

impl VariableStore {
    /// Opens the variable store in the firmware volume exposed by `fvb`, using `ftw` for fault
    /// tolerant rewrites of the store. A fully erased store is formatted, and a store with an
    /// invalid header is rejected with EFI_VOLUME_CORRUPTED.
    pub fn new(
        config: VariableConfig,
        fvb: Box<dyn FirmwareVolumeBlock>,
        ftw: Box<dyn FaultTolerantWrite>,
    ) -> Result<Self, Status> {
        ftw.complete_pending(&*fvb)?;
        let (fvh, nv) = read_volume(&*fvb)?;

        let size = config.volatile_store_size.max(STORE_HEADER_SIZE);
        let mut volatile = alloc::vec![0xffu8; size];
        volatile[..STORE_HEADER_SIZE]
            .copy_from_slice(&VariableStoreHeader::new(size as u32).to_bytes());
        let live_volatile = volatile.clone();

        let store = VariableStore {
            config,
            fvb,
            ftw,
            state: RefCell::new(StoreState {
                volatile,
                nv,
                nv_base: fvh.header_length as usize,
                block_map: fvh.block_map,
                fv_length: fvh.fv_length as usize,
                volatile_last: start_offset(),
                nv_last: start_offset(),
                common_total: 0,
                hwerr_total: 0,
            }),
            live_volatile: RefCell::new(live_volatile),
            lang: RefCell::new(LangState::default()),
            at_runtime: Cell::new(false),
            resync: Cell::new(false),
            info: RefCell::new(BTreeMap::new()),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), Status> {
        let mut st = self.lock()?;
        let size = st.nv.len() as u32;
        match VariableStoreHeader::status(&st.nv) {
            StoreStatus::Raw => {
                log::info!("Formatting variable store of {:#x} bytes\n", size);
                let header = VariableStoreHeader::new(size).to_bytes();
                self.update_store(&mut st, false, 0, &header)?;
            }
            StoreStatus::Valid => {
                if VariableStoreHeader::parse(&st.nv).map(|h| h.size) == Some(u32::MAX) {
                    debug!("Repairing variable store size\n");
                    self.update_store(&mut st, false, 16, &size.to_le_bytes())?;
                }
            }
            StoreStatus::Invalid => {
                warn!("Variable store header is corrupted\n");
                return Err(Status::EFI_VOLUME_CORRUPTED);
            }
        }
        if VariableStoreHeader::status(&st.nv) != StoreStatus::Valid {
            return Err(Status::EFI_DEVICE_ERROR);
        }
        self.recover(&mut st)
    }

    /// Takes the store state. A call made while another call holds it proceeds on a private
    /// state rescanned from the live stores, and the holder's state is resynchronized on the
    /// next call.
    fn lock(&self) -> Result<StoreGuard<'_>, Status> {
        let Ok(mut st) = self.state.try_borrow_mut() else {
            debug!("Re-entrant variable services call, rescanning the stores\n");
            self.resync.set(true);
            return self.load_state().map(|st| StoreGuard::Private(Box::new(st)));
        };
        if self.resync.replace(false) {
            if let Err(e) = self.recover(&mut st) {
                self.resync.set(true);
                return Err(e);
            }
        }
        Ok(StoreGuard::Shared(st))
    }

    /// Builds a state from the live stores, with the last written offsets and the accounting
    /// recomputed from their contents.
    fn load_state(&self) -> Result<StoreState, Status> {
        let (fvh, nv) = read_volume(&*self.fvb)?;
        let volatile = self.live_volatile.borrow().clone();
        let mut st = StoreState {
            volatile_last: last_offset(&volatile),
            volatile,
            nv,
            nv_base: fvh.header_length as usize,
            block_map: fvh.block_map,
            fv_length: fvh.fv_length as usize,
            nv_last: start_offset(),
            common_total: 0,
            hwerr_total: 0,
        };
        Self::rescan(&mut st);
        Ok(st)
    }

    /// Brings the mirror and the offsets in line with the contents of the flash, and reclaims
    /// the store if a previous write left debris in the free area.
    fn recover(&self, st: &mut StoreState) -> Result<(), Status> {
        self.ftw.complete_pending(&*self.fvb)?;
        let len = st.nv.len();
        self.read_back(st, 0, len)?;
        Self::rescan(st);

        st.volatile.clone_from(&self.live_volatile.borrow());
        st.volatile_last = last_offset(&st.volatile);

        let end = end_offset(&st.nv);
        if st.nv[st.nv_last.min(end)..end].iter().any(|&b| b != 0xff) {
            warn!("Variable store free space is not erased, reclaiming\n");
            self.reclaim_store(st, false, None)?;
        }
        Ok(())
    }

    fn rescan(st: &mut StoreState) {
        let (mut common, mut hwerr) = (0, 0);
        for rec in records(&st.nv) {
            let size = rec.total_size(&st.nv);
            if rec.attributes(&st.nv) & NV_HWERR == NV_HWERR {
                hwerr += size;
            } else {
                common += size;
            }
        }
        st.nv_last = last_offset(&st.nv);
        st.common_total = common;
        st.hwerr_total = hwerr;
    }

    fn read_back(&self, st: &mut StoreState, offset: usize, len: usize) -> Result<(), Status> {
        let StoreState {
            block_map,
            nv,
            nv_base,
            ..
        } = st;
        let fvb = &self.fvb;
        for_each_block(block_map, *nv_base + offset, len, |lba, off, r| {
            fvb.read(lba, off, &mut nv[offset + r.start..offset + r.end])
        })
    }

    /// Writes `data` at `offset` into the volatile or the non-volatile store. Non-volatile
    /// writes are split along the block boundaries of the volume, and are subject to NOR
    /// semantics.
    fn update_store(
        &self,
        st: &mut StoreState,
        volatile: bool,
        offset: usize,
        data: &[u8],
    ) -> Result<(), Status> {
        if volatile {
            let end = offset
                .checked_add(data.len())
                .filter(|&e| e <= st.volatile.len())
                .ok_or(Status::EFI_INVALID_PARAMETER)?;
            self.live_volatile.borrow_mut()[offset..end].copy_from_slice(data);
            st.volatile[offset..end].copy_from_slice(data);
            return Ok(());
        }

        let linear = st.nv_base + offset;
        if linear + data.len() > st.fv_length {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        let fvb = &self.fvb;
        let result = for_each_block(&st.block_map, linear, data.len(), |lba, off, r| {
            fvb.write(lba, off, &data[r])
        });
        let synced = self.read_back(st, offset, data.len());
        if let Err(e) = result {
            warn!("Variable store write at {:#x} failed: {:?}\n", offset, e);
            self.resync.set(true);
            return Err(e);
        }
        synced
    }

    /// Low level write of `data` at `offset` into one of the stores, bypassing all variable
    /// semantics.
    pub fn update_variable_store(
        &self,
        volatile: bool,
        offset: usize,
        data: &[u8],
    ) -> Result<(), Status> {
        let mut st = self.lock()?;
        self.update_store(&mut st, volatile, offset, data)
    }

    fn find(
        &self,
        st: &StoreState,
        name: &[u16],
        guid: Option<&Guid>,
    ) -> Result<VariablePointerTrack, Status> {
        if !name.is_empty() && guid.is_none() {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        let encoded = encode_name(name);
        let runtime = self.at_runtime.get();
        for volatile in [true, false] {
            let store = st.store(volatile);
            let mut in_deleted = None;
            for record in records(store) {
                let state = record.state(store);
                if state != VAR_ADDED && state != VAR_ADDED & VAR_IN_DELETED_TRANSITION {
                    continue;
                }
                if runtime && record.attributes(store) & EFI_VARIABLE_RUNTIME_ACCESS == 0 {
                    continue;
                }
                if !name.is_empty() && !guid.map_or(false, |g| record.matches(store, g, &encoded)) {
                    continue;
                }
                let track = VariablePointerTrack { volatile, record };
                if state == VAR_ADDED {
                    return Ok(track);
                }
                in_deleted.get_or_insert(track);
            }
            if let Some(track) = in_deleted {
                return Ok(track);
            }
        }
        Err(Status::EFI_NOT_FOUND)
    }

    fn snapshot(st: &StoreState, track: VariablePointerTrack) -> Variable {
        let store = st.store(track.volatile);
        let r = track.record;
        Variable {
            name: U16CString::from_vec_truncate(r.name_ucs2(store)),
            guid: r.guid(store),
            attributes: r.attributes(store),
            data: r.data(store).to_vec(),
            auth: AuthFields {
                monotonic_count: r.monotonic_count(store),
                timestamp: r.timestamp(store),
                pubkey_index: r.pubkey_index(store),
            },
            state: r.state(store),
            volatile: track.volatile,
        }
    }

    /// Looks up a variable, preferring the volatile store. A record that is in transition to
    /// deletion is only returned if no live record of the variable exists. An empty name
    /// yields the first variable in the stores.
    pub fn find_variable(&self, name: &U16CStr, guid: Option<&Guid>) -> Result<Variable, Status> {
        let st = self.lock()?;
        let track = self.find(&st, name.as_slice(), guid)?;
        Ok(Self::snapshot(&st, track))
    }

    /// Returns the attributes and the data of a variable
    pub fn get_variable(&self, name: &U16CStr, guid: &Guid) -> Result<(u32, Vec<u8>), Status> {
        if name.is_empty() {
            return Err(Status::EFI_NOT_FOUND);
        }
        let st = self.lock()?;
        let track = self.find(&st, name.as_slice(), Some(guid))?;
        let store = st.store(track.volatile);
        let result = (
            track.record.attributes(store),
            track.record.data(store).to_vec(),
        );
        drop(st);
        self.count(name.as_slice(), guid, track.volatile, |e| e.read_count += 1);
        Ok(result)
    }

    /// Returns the name and GUID of the variable following `name`, or of the first variable if
    /// `name` is empty. Volatile variables are enumerated first.
    pub fn get_next_variable_name(
        &self,
        name: &U16CStr,
        guid: &Guid,
    ) -> Result<(U16CString, Guid), Status> {
        let st = self.lock()?;
        let runtime = self.at_runtime.get();

        let (mut volatile, mut cursor) = if name.is_empty() {
            (true, Some(VariableRecord::first()))
        } else {
            let t = self.find(&st, name.as_slice(), Some(guid))?;
            (t.volatile, t.record.next(st.store(t.volatile)))
        };

        loop {
            let store = st.store(volatile);
            let end = end_offset(store);
            match cursor.filter(|r| r.offset < end && r.is_valid(store)) {
                Some(r) => {
                    if r.state(store) == VAR_ADDED
                        && (!runtime || r.attributes(store) & EFI_VARIABLE_RUNTIME_ACCESS != 0)
                    {
                        let name = U16CString::from_vec_truncate(r.name_ucs2(store));
                        return Ok((name, r.guid(store)));
                    }
                    cursor = r.next(store);
                }
                None if volatile => {
                    volatile = false;
                    cursor = Some(VariableRecord::first());
                }
                None => return Err(Status::EFI_NOT_FOUND),
            }
        }
    }

    /// Validates the arguments of a SetVariable call
    pub fn check_set_parameters(
        &self,
        name: &U16CStr,
        attributes: u32,
        data_size: usize,
    ) -> Result<(), Status> {
        if name.is_empty() || attributes & !EFI_VARIABLE_ATTRIBUTES_MASK != 0 {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        if attributes & ACCESS == EFI_VARIABLE_RUNTIME_ACCESS {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        let size = VARIABLE_HEADER_SIZE + (name.len() + 1) * 2 + data_size;
        if attributes & NV_HWERR == NV_HWERR {
            if data_size > self.config.max_hardware_error_variable_size
                || size > self.config.max_hardware_error_variable_size
                || !name.as_slice().starts_with(HW_ERR_REC_PREFIX)
            {
                return Err(Status::EFI_INVALID_PARAMETER);
            }
        } else if attributes & EFI_VARIABLE_HARDWARE_ERROR_RECORD != 0 {
            return Err(Status::EFI_INVALID_PARAMETER);
        } else if data_size > self.config.max_variable_size || size > self.config.max_variable_size
        {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        Ok(())
    }

    /// SetVariable for variables without authenticated write access. Writing an empty buffer,
    /// or clearing all access attributes, deletes the variable.
    pub fn set_variable(
        &self,
        name: &U16CStr,
        guid: &Guid,
        attributes: u32,
        data: &[u8],
    ) -> Result<(), Status> {
        self.check_set_parameters(name, attributes, data.len())?;
        let auth = EFI_VARIABLE_AUTHENTICATED_WRITE_ACCESS
            | EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS;
        if attributes & auth != 0 {
            return Err(Status::EFI_UNSUPPORTED);
        }
        if let Ok(v) = self.find_variable(name, Some(guid)) {
            if v.attributes & auth != 0 {
                return Err(Status::EFI_WRITE_PROTECTED);
            }
        }
        self.update_variable(name, guid, data, attributes, &AuthFields::default())
    }

    /// Writes a variable with the given authentication fields, without any further checks of
    /// the attributes. Writes to the global `Lang` and `PlatformLang` variables update the
    /// other one of the two as well.
    pub fn update_variable(
        &self,
        name: &U16CStr,
        guid: &Guid,
        data: &[u8],
        attributes: u32,
        auth: &AuthFields,
    ) -> Result<(), Status> {
        let mut st = self.lock()?;
        let name = name.as_slice();

        if *guid == EFI_GLOBAL_VARIABLE_GUID {
            let observed = self.lang.borrow_mut().observe(name, data);
            if let Some((companion, value)) = observed {
                let track = self.find(&st, companion, Some(guid)).ok();
                let attr = EFI_VARIABLE_NON_VOLATILE | ACCESS;
                let def = AuthFields::default();
                if let Err(e) = self.update(&mut st, companion, guid, &value, attr, &def, track) {
                    warn!("Failed to update language variable: {:?}\n", e);
                }
            }
        }

        let track = match self.find(&st, name, Some(guid)) {
            Ok(t) => Some(t),
            Err(Status::EFI_NOT_FOUND) => None,
            Err(e) => return Err(e),
        };
        self.update(&mut st, name, guid, data, attributes, auth, track)
    }

    fn has_room(&self, st: &StoreState, volatile: bool, hwerr: bool, size: usize) -> bool {
        if volatile {
            return st.volatile_last + size <= end_offset(&st.volatile);
        }
        let end = end_offset(&st.nv);
        let quota = if hwerr {
            st.hwerr_total + size <= self.config.hw_err_storage_size
        } else {
            let common = end.saturating_sub(STORE_HEADER_SIZE + self.config.hw_err_storage_size);
            st.common_total + size <= common
        };
        quota && st.nv_last + size <= end
    }

    #[allow(clippy::too_many_arguments)]
    fn update(
        &self,
        st: &mut StoreState,
        name: &[u16],
        guid: &Guid,
        data: &[u8],
        attributes: u32,
        auth: &AuthFields,
        track: Option<VariablePointerTrack>,
    ) -> Result<(), Status> {
        let runtime = self.at_runtime.get();
        let append = attributes & EFI_VARIABLE_APPEND_WRITE != 0;
        let attributes = attributes & !EFI_VARIABLE_APPEND_WRITE;
        let mut auth = *auth;
        let mut payload = Cow::Borrowed(data);

        if let Some(t) = track {
            let store = st.store(t.volatile);
            let r = t.record;
            if runtime {
                if t.volatile {
                    return Err(Status::EFI_WRITE_PROTECTED);
                }
                if r.attributes(store) & EFI_VARIABLE_NON_VOLATILE == 0 {
                    return Err(Status::EFI_INVALID_PARAMETER);
                }
            }

            if (data.is_empty() && !append) || attributes & ACCESS == 0 {
                let state = r.state(store) & VAR_DELETED;
                self.update_store(st, t.volatile, r.state_offset(), &[state])?;
                self.count(name, guid, t.volatile, |e| e.delete_count += 1);
                return Ok(());
            }

            if append {
                if data.is_empty() {
                    return Ok(());
                }
                let old = r.data(store);
                if old.len() + data.len() > self.config.max_append_variable_size {
                    return Err(Status::EFI_INVALID_PARAMETER);
                }
                payload = Cow::Owned([old, data].concat());
                let ts = r.timestamp(store);
                if !auth.timestamp.is_later_than(&ts) {
                    auth.timestamp = ts;
                }
            }

            let current = AuthFields {
                monotonic_count: r.monotonic_count(store),
                timestamp: r.timestamp(store),
                pubkey_index: r.pubkey_index(store),
            };
            if r.data(store) == &payload[..]
                && r.attributes(store) == attributes
                && current == auth
            {
                self.count(name, guid, t.volatile, |e| e.write_count += 1);
                return Ok(());
            }

            let state = r.state(store);
            if state == VAR_ADDED {
                let state = state & VAR_IN_DELETED_TRANSITION;
                self.update_store(st, t.volatile, r.state_offset(), &[state])?;
            }
        } else {
            if data.is_empty() || attributes & ACCESS == 0 {
                return Err(Status::EFI_NOT_FOUND);
            }
            if runtime
                && (attributes & EFI_VARIABLE_RUNTIME_ACCESS == 0
                    || attributes & EFI_VARIABLE_NON_VOLATILE == 0)
            {
                return Err(Status::EFI_INVALID_PARAMETER);
            }
        }

        let volatile = attributes & EFI_VARIABLE_NON_VOLATILE == 0;
        let hwerr = attributes & NV_HWERR == NV_HWERR;
        let mut record = encode_record(
            0xff,
            attributes,
            &auth,
            guid,
            &encode_name(name),
            &payload,
        );
        let size = record.len();

        let mut relocated = None;
        let mut reclaimed = false;
        if !self.has_room(st, volatile, hwerr, size) {
            if runtime && !volatile {
                return Err(Status::EFI_OUT_OF_RESOURCES);
            }
            let updating = track.filter(|t| t.volatile == volatile).map(|t| t.record);
            relocated = self.reclaim_store(st, volatile, updating)?;
            reclaimed = true;
            if !self.has_room(st, volatile, hwerr, size) {
                return Err(Status::EFI_OUT_OF_RESOURCES);
            }
        }

        let offset = st.last(volatile);
        if volatile {
            record[2] = VAR_ADDED;
            self.update_store(st, true, offset, &record)?;
            st.volatile_last += size;
        } else {
            self.update_store(st, false, offset, &record[..VARIABLE_HEADER_SIZE])?;
            self.update_store(st, false, offset + 2, &[VAR_HEADER_VALID_ONLY])?;
            let body = &record[VARIABLE_HEADER_SIZE..];
            self.update_store(st, false, offset + VARIABLE_HEADER_SIZE, body)?;
            self.update_store(st, false, offset + 2, &[VAR_ADDED])?;
            st.nv_last += size;
            if hwerr {
                st.hwerr_total += size;
            } else {
                st.common_total += size;
            }
        }

        if let Some(t) = track {
            let old = if reclaimed && t.volatile == volatile {
                relocated
            } else {
                Some(t.record)
            };
            if let Some(r) = old {
                let state = r.state(st.store(t.volatile)) & VAR_DELETED;
                self.update_store(st, t.volatile, r.state_offset(), &[state])?;
            }
        }
        self.count(name, guid, volatile, |e| e.write_count += 1);
        Ok(())
    }

    /// Rewrites a store with only its live records. The record `updating`, if given, is the
    /// record of the variable being written: it is preserved, and its new location is returned.
    /// Records in transition to deletion for which no live record exists are promoted.
    fn reclaim_store(
        &self,
        st: &mut StoreState,
        volatile: bool,
        updating: Option<VariableRecord>,
    ) -> Result<Option<VariableRecord>, Status> {
        fn copy(
            buf: &mut Vec<u8>,
            store: &[u8],
            r: VariableRecord,
            totals: &mut (usize, usize),
        ) -> VariableRecord {
            let at = VariableRecord { offset: buf.len() };
            let size = r.total_size(store);
            buf.extend_from_slice(&store[r.offset..r.offset + size]);
            if r.attributes(store) & NV_HWERR == NV_HWERR {
                totals.1 += size;
            } else {
                totals.0 += size;
            }
            at
        }

        let store = st.store(volatile);
        let end = end_offset(store);
        let before = st.last(volatile);
        let mut buf = store[..start_offset()].to_vec();
        let mut totals = (0, 0);

        let key = updating.map(|u| (u.guid(store), u.name(store)));
        for r in records(store) {
            if r.state(store) != VAR_ADDED || Some(r) == updating {
                continue;
            }
            if let Some((g, n)) = &key {
                if r.matches(store, g, n) {
                    continue;
                }
            }
            copy(&mut buf, store, r, &mut totals);
        }

        let relocated = updating.map(|u| copy(&mut buf, store, u, &mut totals));

        for r in records(store) {
            if Some(r) == updating || r.state(store) != VAR_ADDED & VAR_IN_DELETED_TRANSITION {
                continue;
            }
            let (g, n) = (r.guid(store), r.name(store));
            if records(&buf).any(|a| a.matches(&buf, &g, n)) {
                continue;
            }
            let at = copy(&mut buf, store, r, &mut totals);
            buf[at.state_offset()] = VAR_ADDED;
        }

        let len = buf.len();
        if len > end {
            return Err(Status::EFI_OUT_OF_RESOURCES);
        }

        if volatile {
            st.volatile[..end].fill(0xff);
            st.volatile[..len].copy_from_slice(&buf);
            st.volatile_last = len;
            self.live_volatile.borrow_mut().clone_from(&st.volatile);
        } else {
            buf.resize(end, 0xff);
            let (lba, offset) = locate(&st.block_map, st.nv_base)
                .ok_or(Status::EFI_INVALID_PARAMETER)?;
            let result = self.ftw.write(&*self.fvb, lba, offset, &buf);
            let synced = self.read_back(st, 0, end);
            if let Err(e) = result.and(synced) {
                warn!("Variable store reclaim failed: {:?}\n", e);
                st.nv_last = 0;
                self.resync.set(true);
                return Err(e);
            }
            st.nv_last = len;
            st.common_total = totals.0;
            st.hwerr_total = totals.1;
        }
        debug!(
            "Reclaimed {} variable store: {:#x} -> {:#x} bytes\n",
            if volatile { "volatile" } else { "non-volatile" },
            before,
            len
        );
        Ok(relocated)
    }

    /// Garbage collects the volatile or the non-volatile store. Not available at runtime.
    pub fn reclaim(&self, volatile: bool) -> Result<(), Status> {
        if self.at_runtime.get() {
            return Err(Status::EFI_UNSUPPORTED);
        }
        let mut st = self.lock()?;
        self.reclaim_store(&mut st, volatile, None).map(|_| ())
    }

    /// Reclaims the non-volatile store if the space that remains for ordinary variables, or
    /// for hardware error records, has dropped below the size of one maximum sized record.
    /// Intended to be called right before control is handed to the OS loader.
    pub fn reclaim_for_os(&self) -> Result<(), Status> {
        if self.at_runtime.get() {
            return Err(Status::EFI_UNSUPPORTED);
        }
        let mut st = self.lock()?;
        let hw = self.config.hw_err_storage_size;
        let common = end_offset(&st.nv).saturating_sub(STORE_HEADER_SIZE + hw);
        let remaining_common = common.saturating_sub(st.common_total);
        let remaining_hw = hw.saturating_sub(st.hwerr_total);
        if remaining_common < self.config.max_variable_size
            || (hw != 0 && remaining_hw < self.config.max_hardware_error_variable_size)
        {
            self.reclaim_store(&mut st, false, None)?;
        }
        Ok(())
    }

    /// Returns the storage size, the remaining storage and the maximum variable size for
    /// variables with the given attributes.
    pub fn query_variable_info(&self, attributes: u32) -> Result<VariableStorageInfo, Status> {
        if attributes == 0 || attributes & !EFI_VARIABLE_ATTRIBUTES_MASK != 0 {
            return Err(Status::EFI_INVALID_PARAMETER);
        }
        if attributes & (EFI_VARIABLE_NON_VOLATILE | ACCESS | EFI_VARIABLE_HARDWARE_ERROR_RECORD)
            == 0
        {
            return Err(Status::EFI_UNSUPPORTED);
        }
        let runtime = self.at_runtime.get();
        if attributes & ACCESS == EFI_VARIABLE_RUNTIME_ACCESS
            || (runtime && attributes & EFI_VARIABLE_RUNTIME_ACCESS == 0)
            || (attributes & NV_HWERR == EFI_VARIABLE_HARDWARE_ERROR_RECORD)
        {
            return Err(Status::EFI_INVALID_PARAMETER);
        }

        let st = self.lock()?;
        let nv = attributes & EFI_VARIABLE_NON_VOLATILE != 0;
        let hwerr = attributes & NV_HWERR == NV_HWERR;
        let store = st.store(!nv);
        let size = end_offset(store);

        let (max_storage, max_var) = if hwerr {
            (
                self.config.hw_err_storage_size,
                self.config.max_hardware_error_variable_size,
            )
        } else if nv {
            (
                size.saturating_sub(STORE_HEADER_SIZE + self.config.hw_err_storage_size),
                self.config.max_variable_size,
            )
        } else {
            (
                size.saturating_sub(STORE_HEADER_SIZE),
                self.config.max_variable_size,
            )
        };
        let max_var = max_var.saturating_sub(VARIABLE_HEADER_SIZE);

        // At runtime, retired records can no longer be reclaimed and so they count as used
        let used: usize = records(store)
            .filter(|r| runtime || r.state(store) == VAR_ADDED)
            .filter(|r| (r.attributes(store) & NV_HWERR == NV_HWERR) == hwerr)
            .map(|r| r.total_size(store))
            .sum();

        let remaining = max_storage.saturating_sub(used);
        let max_var = if remaining < VARIABLE_HEADER_SIZE {
            0
        } else {
            max_var.min(remaining - VARIABLE_HEADER_SIZE)
        };
        Ok(VariableStorageInfo {
            maximum_variable_storage_size: max_storage as u64,
            remaining_variable_storage_size: remaining as u64,
            maximum_variable_size: max_var as u64,
        })
    }

    /// Switches to runtime behavior: only variables with runtime access are visible, volatile
    /// variables are read-only, and the stores are no longer reclaimed.
    pub fn exit_boot_services(&self) {
        self.at_runtime.set(true);
    }

    pub fn at_runtime(&self) -> bool {
        self.at_runtime.get()
    }

    /// Per variable access statistics, in (GUID, name) order
    pub fn variable_info(&self) -> Vec<VariableInfoEntry> {
        self.info.borrow().values().cloned().collect()
    }

    fn count(
        &self,
        name: &[u16],
        guid: &Guid,
        volatile: bool,
        f: impl FnOnce(&mut VariableInfoEntry),
    ) {
        let mut info = self.info.borrow_mut();
        let entry = info
            .entry((*guid, name.to_vec()))
            .or_insert_with(|| VariableInfoEntry {
                guid: *guid,
                name: U16CString::from_vec_truncate(name.to_vec()),
                volatile,
                read_count: 0,
                write_count: 0,
                delete_count: 0,
            });
        entry.volatile = volatile;
        f(entry);
    }

    /// Offset just past the last record of the volatile or non-volatile store
    pub fn last_variable_offset(&self, volatile: bool) -> usize {
        self.state
            .try_borrow()
            .map_or(0, |st| st.last(volatile))
    }

    /// A copy of the volatile or non-volatile store
    pub fn store_image(&self, volatile: bool) -> Vec<u8> {
        self.state
            .try_borrow()
            .map(|st| st.store(volatile).to_vec())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fvb::{MemoryFlash, MemoryFtw};
    use alloc::rc::Rc;
    use widestring::u16cstr;

    const G: Guid = guid!("3b3c3e6a-8a4f-4f25-9d54-0d6cc3a0d1e2");
    const NV_BS_RT: u32 = EFI_VARIABLE_NON_VOLATILE | ACCESS;
    const NV_BS: u32 = EFI_VARIABLE_NON_VOLATILE | EFI_VARIABLE_BOOTSERVICE_ACCESS;

    fn open(flash: &MemoryFlash, ftw: &MemoryFtw, config: VariableConfig) -> VariableStore {
        VariableStore::new(config, Box::new(flash.clone()), Box::new(ftw.clone())).unwrap()
    }

    fn new_store(block_size: usize, blocks: usize) -> (VariableStore, MemoryFlash, MemoryFtw) {
        let flash = MemoryFlash::new_variable_volume(block_size, blocks);
        let ftw = MemoryFtw::new();
        (open(&flash, &ftw, VariableConfig::default()), flash, ftw)
    }

    /// The size declared in the header of the non-volatile store
    fn declared_size(vs: &VariableStore) -> usize {
        VariableStoreHeader::parse(&vs.store_image(false)).unwrap().size as usize
    }

    fn name(i: usize) -> U16CString {
        let s: Vec<u16> = alloc::format!("Var{:02}", i).encode_utf16().collect();
        U16CString::from_vec_truncate(s)
    }

    #[test]
    fn set_and_get() {
        let (vs, _, _) = new_store(0x1000, 4);
        let foo = u16cstr!("Foo");
        vs.set_variable(foo, &G, NV_BS_RT, &[1, 2, 3, 4]).unwrap();
        assert_eq!(vs.get_variable(foo, &G), Ok((NV_BS_RT, alloc::vec![1, 2, 3, 4])));

        vs.set_variable(foo, &G, 0, &[]).unwrap();
        assert_eq!(vs.get_variable(foo, &G), Err(Status::EFI_NOT_FOUND));
        assert_eq!(vs.set_variable(foo, &G, 0, &[]), Err(Status::EFI_NOT_FOUND));

        let info = vs.variable_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].read_count, 1);
        assert_eq!(info[0].write_count, 1);
        assert_eq!(info[0].delete_count, 1);
    }

    #[test]
    fn persists_across_reboot() {
        let (vs, flash, ftw) = new_store(0x1000, 4);
        vs.set_variable(u16cstr!("Boot"), &G, NV_BS_RT, b"nv").unwrap();
        vs.set_variable(u16cstr!("Temp"), &G, ACCESS, b"ram").unwrap();
        drop(vs);

        let vs = open(&flash, &ftw, VariableConfig::default());
        assert_eq!(vs.get_variable(u16cstr!("Boot"), &G), Ok((NV_BS_RT, b"nv".to_vec())));
        assert_eq!(vs.get_variable(u16cstr!("Temp"), &G), Err(Status::EFI_NOT_FOUND));
    }

    #[test]
    fn identical_write_is_a_noop() {
        let (vs, flash, _) = new_store(0x1000, 4);
        vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, &[7; 16]).unwrap();
        let last = vs.last_variable_offset(false);
        let ops = flash.op_counts();
        vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, &[7; 16]).unwrap();
        assert_eq!(vs.last_variable_offset(false), last);
        assert_eq!(flash.op_counts(), ops);

        vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, &[8; 16]).unwrap();
        assert!(vs.last_variable_offset(false) > last);
        let image = vs.store_image(false);
        let states: Vec<u8> = records(&image).map(|r| r.state(&image)).collect();
        assert_eq!(states, [VAR_ADDED & VAR_IN_DELETED_TRANSITION & VAR_DELETED, VAR_ADDED]);
    }

    #[test]
    fn append_write() {
        let (vs, _, _) = new_store(0x1000, 4);
        let foo = u16cstr!("Foo");
        let append = NV_BS_RT | EFI_VARIABLE_APPEND_WRITE;
        vs.set_variable(foo, &G, append, b"ab").unwrap();
        vs.set_variable(foo, &G, append, b"cd").unwrap();
        vs.set_variable(foo, &G, append, b"").unwrap();
        assert_eq!(vs.get_variable(foo, &G), Ok((NV_BS_RT, b"abcd".to_vec())));
    }

    #[test]
    fn parameter_checks() {
        let (vs, _, _) = new_store(0x1000, 4);
        let foo = u16cstr!("Foo");
        assert_eq!(
            vs.set_variable(u16cstr!(""), &G, NV_BS_RT, &[1]),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        assert_eq!(
            vs.set_variable(foo, &G, EFI_VARIABLE_RUNTIME_ACCESS, &[1]),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        assert_eq!(
            vs.set_variable(foo, &G, NV_BS_RT, &[0; 0x400]),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        let max = 0x400 - VARIABLE_HEADER_SIZE - 8;
        vs.set_variable(foo, &G, NV_BS_RT, &alloc::vec![0; max]).unwrap();
        assert_eq!(
            vs.set_variable(foo, &G, NV_BS_RT | EFI_VARIABLE_AUTHENTICATED_WRITE_ACCESS, &[1]),
            Err(Status::EFI_UNSUPPORTED)
        );
        assert_eq!(
            vs.get_variable(u16cstr!(""), &G),
            Err(Status::EFI_NOT_FOUND)
        );
    }

    #[test]
    fn hardware_error_records() {
        let flash = MemoryFlash::new_variable_volume(0x1000, 4);
        let ftw = MemoryFtw::new();
        let config = VariableConfig {
            hw_err_storage_size: 0x1000,
            ..Default::default()
        };
        let vs = open(&flash, &ftw, config);
        let attr = NV_BS_RT | EFI_VARIABLE_HARDWARE_ERROR_RECORD;

        assert_eq!(
            vs.set_variable(u16cstr!("Foo"), &G, attr, &[1]),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        assert_eq!(
            vs.set_variable(
                u16cstr!("HwErrRec0001"),
                &G,
                ACCESS | EFI_VARIABLE_HARDWARE_ERROR_RECORD,
                &[1]
            ),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        // larger than an ordinary variable may be
        let record = alloc::vec![0x5a; 0x800];
        vs.set_variable(u16cstr!("HwErrRec0001"), &G, attr, &record).unwrap();
        assert_eq!(vs.get_variable(u16cstr!("HwErrRec0001"), &G), Ok((attr, record.clone())));
        assert_eq!(
            vs.set_variable(u16cstr!("HwErrRec0002"), &G, attr, &record),
            Err(Status::EFI_OUT_OF_RESOURCES)
        );

        let info = vs.query_variable_info(attr).unwrap();
        assert_eq!(info.maximum_variable_storage_size, 0x1000);
        assert_eq!(info.remaining_variable_storage_size, 0x1000 - (60 + 26 + 2 + 0x800));

        let common = vs.query_variable_info(NV_BS_RT).unwrap();
        let volume = 4 * 0x1000 - 72;
        assert_eq!(common.maximum_variable_storage_size as usize, volume - 28 - 0x1000);
        assert_eq!(common.remaining_variable_storage_size, common.maximum_variable_storage_size);
    }

    #[test]
    fn query_variable_info() {
        let (vs, _, _) = new_store(0x1000, 4);
        assert_eq!(vs.query_variable_info(0), Err(Status::EFI_INVALID_PARAMETER));
        assert_eq!(
            vs.query_variable_info(EFI_VARIABLE_APPEND_WRITE),
            Err(Status::EFI_UNSUPPORTED)
        );
        assert_eq!(
            vs.query_variable_info(EFI_VARIABLE_RUNTIME_ACCESS),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        assert_eq!(
            vs.query_variable_info(EFI_VARIABLE_HARDWARE_ERROR_RECORD | ACCESS),
            Err(Status::EFI_INVALID_PARAMETER)
        );

        vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, &[1; 8]).unwrap();
        let info = vs.query_variable_info(NV_BS_RT).unwrap();
        let max = (4 * 0x1000 - 72 - 28) as u64;
        assert_eq!(info.maximum_variable_storage_size, max);
        assert_eq!(info.remaining_variable_storage_size, max - (60 + 8 + 8));
        assert_eq!(info.maximum_variable_size, 0x400 - 60);

        let volatile = vs.query_variable_info(ACCESS).unwrap();
        assert_eq!(volatile.maximum_variable_storage_size, 0x10000 - 28);
        assert_eq!(volatile.remaining_variable_storage_size, 0x10000 - 28);
    }

    #[test]
    fn enumeration_order() {
        let (vs, _, _) = new_store(0x1000, 4);
        vs.set_variable(u16cstr!("A"), &G, NV_BS_RT, &[1]).unwrap();
        vs.set_variable(u16cstr!("B"), &G, ACCESS, &[1]).unwrap();
        vs.set_variable(u16cstr!("C"), &G, NV_BS_RT, &[1]).unwrap();
        vs.set_variable(u16cstr!("A"), &G, NV_BS_RT, &[2]).unwrap();

        let mut names = Vec::new();
        let mut cur = (U16CString::new(), Guid::default());
        while let Ok(next) = vs.get_next_variable_name(&cur.0, &cur.1) {
            names.push(next.0.to_string_lossy());
            cur = next;
        }
        assert_eq!(names, ["B", "C", "A"]);
        assert_eq!(
            vs.get_next_variable_name(u16cstr!("Z"), &G),
            Err(Status::EFI_NOT_FOUND)
        );
    }

    #[test]
    fn runtime_restrictions() {
        let (vs, _, _) = new_store(0x1000, 4);
        vs.set_variable(u16cstr!("Rt"), &G, ACCESS, &[1]).unwrap();
        vs.set_variable(u16cstr!("Bs"), &G, NV_BS, &[1]).unwrap();
        vs.set_variable(u16cstr!("Nv"), &G, NV_BS_RT, &[1]).unwrap();
        vs.exit_boot_services();

        assert_eq!(vs.get_variable(u16cstr!("Bs"), &G), Err(Status::EFI_NOT_FOUND));
        assert_eq!(
            vs.set_variable(u16cstr!("Rt"), &G, ACCESS, &[2]),
            Err(Status::EFI_WRITE_PROTECTED)
        );
        assert_eq!(
            vs.set_variable(u16cstr!("New"), &G, ACCESS, &[2]),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        assert_eq!(
            vs.set_variable(u16cstr!("New"), &G, NV_BS, &[2]),
            Err(Status::EFI_INVALID_PARAMETER)
        );
        vs.set_variable(u16cstr!("Nv"), &G, NV_BS_RT, &[2]).unwrap();
        assert_eq!(vs.get_variable(u16cstr!("Nv"), &G), Ok((NV_BS_RT, alloc::vec![2])));
        assert_eq!(vs.reclaim(false), Err(Status::EFI_UNSUPPORTED));
        assert_eq!(
            vs.query_variable_info(NV_BS),
            Err(Status::EFI_INVALID_PARAMETER)
        );
    }

    #[test]
    fn full_store_reclaims_once() {
        let flash = MemoryFlash::new_variable_volume(0x400, 4);
        let ftw = MemoryFtw::new();
        let vs = open(&flash, &ftw, VariableConfig::default());
        // 60 + 12 + 0x100 = 328 bytes per record, 12 of which fit
        for i in 0..12 {
            vs.set_variable(&name(i), &G, NV_BS_RT, &[i as u8; 0x100]).unwrap();
        }
        let full = vs.last_variable_offset(false);
        assert_eq!(
            vs.set_variable(u16cstr!("Extra"), &G, NV_BS_RT, &[1; 0x100]),
            Err(Status::EFI_OUT_OF_RESOURCES)
        );
        assert_eq!(ftw.completed_writes(), 1);
        // nothing was retired, so the rewritten store is as large as before
        assert_eq!(vs.last_variable_offset(false), full);

        for i in 0..3 {
            vs.set_variable(&name(i), &G, NV_BS_RT, &[]).unwrap();
        }
        let before = vs.last_variable_offset(false);
        vs.set_variable(u16cstr!("Extra"), &G, NV_BS_RT, &[1; 0x100]).unwrap();
        assert_eq!(ftw.completed_writes(), 2);
        let after = vs.last_variable_offset(false);
        assert!(after < before);
        assert!(after <= declared_size(&vs));

        assert_eq!(vs.get_variable(&name(0), &G), Err(Status::EFI_NOT_FOUND));
        for i in 3..12 {
            assert_eq!(
                vs.get_variable(&name(i), &G),
                Ok((NV_BS_RT, alloc::vec![i as u8; 0x100]))
            );
        }
        drop(vs);
        let vs = open(&flash, &ftw, VariableConfig::default());
        assert_eq!(vs.get_variable(u16cstr!("Extra"), &G), Ok((NV_BS_RT, alloc::vec![1; 0x100])));
    }

    #[test]
    fn reclaim_preserves_live_variables() {
        use rand::{Rng, SeedableRng};

        let flash = MemoryFlash::new_variable_volume(0x400, 8);
        let ftw = MemoryFtw::new();
        let vs = open(&flash, &ftw, VariableConfig::default());
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut model: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        let size = declared_size(&vs);

        for _ in 0..200 {
            let (before, reclaims) = (vs.last_variable_offset(false), ftw.completed_writes());
            let i = rng.gen_range(0..8);
            let mut len = 0;
            if rng.gen_bool(0.2) {
                let expected = if model.remove(&i).is_some() {
                    Ok(())
                } else {
                    Err(Status::EFI_NOT_FOUND)
                };
                assert_eq!(vs.set_variable(&name(i), &G, NV_BS_RT, &[]), expected);
            } else {
                len = rng.gen_range(1..0x80);
                let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                vs.set_variable(&name(i), &G, NV_BS_RT, &data).unwrap();
                model.insert(i, data);
            }

            let after = vs.last_variable_offset(false);
            assert!(after <= size);
            if ftw.completed_writes() != reclaims {
                // the reclaim did not grow the store, so at most the new record was added
                let record = VARIABLE_HEADER_SIZE + name(i).len() * 2 + 2 + len + 8;
                assert!(after <= before + record);
            }
        }
        assert!(ftw.completed_writes() > 0);
        let before = vs.last_variable_offset(false);
        vs.reclaim(false).unwrap();
        let after = vs.last_variable_offset(false);
        assert!(after <= before);
        assert!(after <= size);

        let vs = open(&flash, &ftw, VariableConfig::default());
        for i in 0..8 {
            match model.get(&i) {
                Some(data) => {
                    assert_eq!(vs.get_variable(&name(i), &G), Ok((NV_BS_RT, data.clone())))
                }
                None => assert_eq!(vs.get_variable(&name(i), &G), Err(Status::EFI_NOT_FOUND)),
            }
        }
    }

    #[test]
    fn power_failure_yields_old_or_new_value() {
        let mut seen_new = false;
        for budget in 0..10 {
            let flash = MemoryFlash::new_variable_volume(0x1000, 4);
            let ftw = MemoryFtw::new();
            let vs = open(&flash, &ftw, VariableConfig::default());
            vs.set_variable(u16cstr!("Other"), &G, NV_BS_RT, b"keep").unwrap();
            vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, b"old").unwrap();

            flash.fail_after(Some(budget));
            let _ = vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, b"new");
            drop(vs);
            flash.fail_after(None);

            let vs = open(&flash, &ftw, VariableConfig::default());
            let (_, data) = vs.get_variable(u16cstr!("Foo"), &G).unwrap();
            if seen_new {
                assert_eq!(data, b"new");
            } else if data == b"new" {
                seen_new = true;
            } else {
                assert_eq!(data, b"old");
            }
            assert_eq!(vs.get_variable(u16cstr!("Other"), &G), Ok((NV_BS_RT, b"keep".to_vec())));

            vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, b"again").unwrap();
            assert_eq!(vs.get_variable(u16cstr!("Foo"), &G), Ok((NV_BS_RT, b"again".to_vec())));
        }
        assert!(seen_new);
    }

    #[test]
    fn interrupted_reclaim_is_completed() {
        let flash = MemoryFlash::new_variable_volume(0x400, 4);
        let ftw = MemoryFtw::new();
        let vs = open(&flash, &ftw, VariableConfig::default());
        vs.set_variable(u16cstr!("Keep"), &G, NV_BS_RT, &[3; 0x40]).unwrap();
        vs.set_variable(u16cstr!("Drop"), &G, NV_BS_RT, &[4; 0x40]).unwrap();
        vs.set_variable(u16cstr!("Drop"), &G, NV_BS_RT, &[]).unwrap();

        flash.fail_after(Some(2));
        assert_eq!(vs.reclaim(false), Err(Status::EFI_DEVICE_ERROR));
        assert!(ftw.has_pending());
        drop(vs);
        flash.fail_after(None);

        let vs = open(&flash, &ftw, VariableConfig::default());
        assert!(!ftw.has_pending());
        assert_eq!(vs.get_variable(u16cstr!("Keep"), &G), Ok((NV_BS_RT, alloc::vec![3; 0x40])));
        assert_eq!(vs.get_variable(u16cstr!("Drop"), &G), Err(Status::EFI_NOT_FOUND));
        let image = vs.store_image(false);
        assert_eq!(records(&image).count(), 1);
    }

    #[test]
    fn volume_formats() {
        let flash = MemoryFlash::new_blank_volume(0x1000, 2);
        let ftw = MemoryFtw::new();
        let vs = open(&flash, &ftw, VariableConfig::default());
        vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, &[1]).unwrap();
        let image = vs.store_image(false);
        assert_eq!(VariableStoreHeader::status(&image), StoreStatus::Valid);
        assert_eq!(end_offset(&image), 2 * 0x1000 - 72);

        let mut corrupt = flash.snapshot();
        corrupt[72 + 20] = 0;
        let flash = MemoryFlash::from_image(corrupt, 0x1000).unwrap();
        let r = VariableStore::new(VariableConfig::default(), Box::new(flash), Box::new(ftw));
        assert_eq!(r.err(), Some(Status::EFI_VOLUME_CORRUPTED));
    }

    #[test]
    fn dirty_free_space_is_reclaimed() {
        let flash = MemoryFlash::new_variable_volume(0x1000, 2);
        let ftw = MemoryFtw::new();
        let vs = open(&flash, &ftw, VariableConfig::default());
        vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, &[9; 4]).unwrap();
        let last = vs.last_variable_offset(false);
        drop(vs);

        // a torn record without its start marker
        let mut image = flash.snapshot();
        image[72 + last + 4] = 0;
        let flash = MemoryFlash::from_image(image, 0x1000).unwrap();
        let vs = open(&flash, &ftw, VariableConfig::default());
        assert_eq!(ftw.completed_writes(), 1);
        let image = vs.store_image(false);
        assert!(image[last..].iter().all(|&b| b == 0xff));
        assert_eq!(vs.get_variable(u16cstr!("Foo"), &G), Ok((NV_BS_RT, alloc::vec![9; 4])));
    }

    #[test]
    fn language_codes_are_kept_in_sync() {
        let (vs, _, _) = new_store(0x1000, 4);
        let g = &EFI_GLOBAL_VARIABLE_GUID;
        vs.set_variable(u16cstr!("PlatformLangCodes"), g, ACCESS, b"en-US;fr-FR\0").unwrap();
        vs.set_variable(u16cstr!("LangCodes"), g, ACCESS, b"engfra\0").unwrap();

        vs.set_variable(u16cstr!("PlatformLang"), g, NV_BS_RT, b"fr-FR\0").unwrap();
        assert_eq!(vs.get_variable(u16cstr!("Lang"), g), Ok((NV_BS_RT, b"fra\0".to_vec())));

        vs.set_variable(u16cstr!("Lang"), g, NV_BS_RT, b"eng\0").unwrap();
        assert_eq!(
            vs.get_variable(u16cstr!("PlatformLang"), g),
            Ok((NV_BS_RT, b"en-US\0".to_vec()))
        );

        // only the global variables are tracked
        vs.set_variable(u16cstr!("PlatformLang"), &G, NV_BS_RT, b"fr-FR\0").unwrap();
        assert_eq!(vs.get_variable(u16cstr!("Lang"), g), Ok((NV_BS_RT, b"eng\0".to_vec())));
    }

    type Hook = Rc<RefCell<Option<Box<dyn FnOnce()>>>>;

    /// A flash device that runs a hook once, right after it programs a record's ADDED state
    struct HookedFlash {
        flash: MemoryFlash,
        hook: Hook,
    }

    impl FirmwareVolumeBlock for HookedFlash {
        fn get_block_size(&self, lba: Lba) -> Result<(usize, usize), Status> {
            self.flash.get_block_size(lba)
        }

        fn read(&self, lba: Lba, offset: usize, buf: &mut [u8]) -> Result<(), Status> {
            self.flash.read(lba, offset, buf)
        }

        fn write(&self, lba: Lba, offset: usize, data: &[u8]) -> Result<(), Status> {
            self.flash.write(lba, offset, data)?;
            if data == [VAR_ADDED] {
                let hook = self.hook.borrow_mut().take();
                if let Some(f) = hook {
                    f();
                }
            }
            Ok(())
        }

        fn erase_blocks(&self, lba: Lba, count: usize) -> Result<(), Status> {
            self.flash.erase_blocks(lba, count)
        }
    }

    #[test]
    fn reentrant_call_proceeds() {
        let flash = MemoryFlash::new_variable_volume(0x1000, 4);
        let hook = Hook::default();
        let fvb = HookedFlash {
            flash: flash.clone(),
            hook: hook.clone(),
        };
        let vs = Rc::new(
            VariableStore::new(
                VariableConfig::default(),
                Box::new(fvb),
                Box::new(MemoryFtw::new()),
            )
            .unwrap(),
        );
        vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, &[1]).unwrap();
        vs.set_variable(u16cstr!("Temp"), &G, ACCESS, b"ram").unwrap();

        // calls made from within the flash write of the update of Foo below
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (weak, s) = (Rc::downgrade(&vs), seen.clone());
        *hook.borrow_mut() = Some(Box::new(move || {
            let vs = weak.upgrade().unwrap();
            s.borrow_mut().push(vs.get_variable(u16cstr!("Foo"), &G));
            s.borrow_mut().push(vs.get_variable(u16cstr!("Temp"), &G));
            vs.set_variable(u16cstr!("Bar"), &G, NV_BS_RT, &[2]).unwrap();
            vs.set_variable(u16cstr!("Scratch"), &G, ACCESS, &[3]).unwrap();
        }));
        vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, &[4]).unwrap();

        assert!(hook.borrow().is_none());
        assert_eq!(
            seen.borrow().as_slice(),
            &[
                Ok((NV_BS_RT, alloc::vec![4])),
                Ok((ACCESS, b"ram".to_vec()))
            ]
        );
        assert!(vs.resync.get());

        assert_eq!(vs.get_variable(u16cstr!("Bar"), &G), Ok((NV_BS_RT, alloc::vec![2])));
        assert_eq!(vs.get_variable(u16cstr!("Scratch"), &G), Ok((ACCESS, alloc::vec![3])));
        assert!(!vs.resync.get());

        // the offsets were picked up from the flash, so new records land after Bar
        vs.set_variable(u16cstr!("Baz"), &G, NV_BS_RT, &[5]).unwrap();
        let vs = open(&flash, &MemoryFtw::new(), VariableConfig::default());
        assert_eq!(vs.get_variable(u16cstr!("Foo"), &G), Ok((NV_BS_RT, alloc::vec![4])));
        assert_eq!(vs.get_variable(u16cstr!("Bar"), &G), Ok((NV_BS_RT, alloc::vec![2])));
        assert_eq!(vs.get_variable(u16cstr!("Baz"), &G), Ok((NV_BS_RT, alloc::vec![5])));
        assert_eq!(vs.get_variable(u16cstr!("Scratch"), &G), Err(Status::EFI_NOT_FOUND));
    }

    #[test]
    fn call_while_state_is_held_uses_live_stores() {
        let (vs, _, _) = new_store(0x1000, 4);
        vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, &[1]).unwrap();
        {
            let _held = vs.state.borrow_mut();
            assert_eq!(vs.get_variable(u16cstr!("Foo"), &G), Ok((NV_BS_RT, alloc::vec![1])));
            vs.set_variable(u16cstr!("Foo"), &G, NV_BS_RT, &[2]).unwrap();
            assert_eq!(vs.get_variable(u16cstr!("Foo"), &G), Ok((NV_BS_RT, alloc::vec![2])));
        }
        assert_eq!(vs.get_variable(u16cstr!("Foo"), &G), Ok((NV_BS_RT, alloc::vec![2])));
        assert_eq!(vs.find_variable(u16cstr!("Foo"), Some(&G)).map(|v| v.state), Ok(VAR_ADDED));
    }

    #[test]
    fn block_splitting() {
        let map = [(2, 0x100), (1, 0x200)];
        let mut pieces = Vec::new();
        for_each_block(&map, 0xf0, 0x220, |lba, off, r| {
            pieces.push((lba, off, r));
            Ok(())
        })
        .unwrap();
        assert_eq!(pieces, [(0, 0xf0, 0..0x10), (1, 0, 0x10..0x110), (2, 0, 0x110..0x220)]);
        assert_eq!(locate(&map, 0x210), Some((2, 0x10)));
        assert_eq!(locate(&map, 0x400), None);
        assert!(for_each_block(&map, 0x300, 0x200, |_, _, _| Ok(())).is_err());
    }
}
