// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

//! Keeps the `Lang` and `PlatformLang` global variables in sync.
//!
//! `LangCodes` is a concatenation of ISO 639-2 three letter codes, `PlatformLangCodes` a `;`
//! separated list of RFC 4646 tags, and the two lists are in the same order. Setting one of the
//! two current language variables sets the other to the entry at the same index.

use alloc::vec::Vec;
use const_utf16::encode as utf16;

pub(crate) const LANG_CODES: &[u16] = utf16!("LangCodes");
pub(crate) const PLATFORM_LANG_CODES: &[u16] = utf16!("PlatformLangCodes");
pub(crate) const LANG: &[u16] = utf16!("Lang");
pub(crate) const PLATFORM_LANG: &[u16] = utf16!("PlatformLang");

const ISO_639_2_ENTRY_SIZE: usize = 3;

/// The ASCII string in `data`, up to its NUL terminator if it has one
fn ascii_str(data: &[u8]) -> &[u8] {
    let len = data.iter().position(|&c| c == 0).unwrap_or(data.len());
    &data[..len]
}

fn entries(supported: &[u8], iso639: bool) -> impl Iterator<Item = &[u8]> {
    let (iso, rfc) = if iso639 {
        (Some(supported.chunks(ISO_639_2_ENTRY_SIZE)), None)
    } else {
        (None, Some(supported.split(|&c| c == b';')))
    };
    iso.into_iter()
        .flatten()
        .chain(rfc.into_iter().flatten())
        .filter(|e| !e.is_empty())
}

/// Returns the index of `lang` in the list of supported language codes
pub(crate) fn index_of(supported: &[u8], lang: &[u8], iso639: bool) -> Option<usize> {
    entries(supported, iso639).position(|e| e == lang)
}

/// Returns the language code at `index` in the list of supported language codes
pub(crate) fn lang_at(supported: &[u8], index: usize, iso639: bool) -> Option<&[u8]> {
    entries(supported, iso639).nth(index)
}

/// Finds the supported language that best matches `lang`. ISO 639-2 codes must match exactly,
/// RFC 4646 tags are matched by stripping subtags from the right until an entry matches.
pub(crate) fn best_language<'a>(
    supported: &'a [u8],
    lang: &[u8],
    iso639: bool,
) -> Option<&'a [u8]> {
    if iso639 {
        let lang = lang.get(..ISO_639_2_ENTRY_SIZE)?;
        return entries(supported, true).find(|e| e.eq_ignore_ascii_case(lang));
    }
    let mut candidate = lang;
    while !candidate.is_empty() {
        if let Some(e) = entries(supported, false).find(|e| e.eq_ignore_ascii_case(candidate)) {
            return Some(e);
        }
        let cut = candidate.iter().rposition(|&c| c == b'-').unwrap_or(0);
        candidate = &candidate[..cut];
    }
    None
}

/// The supported language lists, as recorded when they were set
#[derive(Default, Debug)]
pub(crate) struct LangState {
    platform_lang_codes: Vec<u8>,
    lang_codes: Vec<u8>,
}

impl LangState {
    /// Records a write of `data` to the global variable `name`, and returns the name and new
    /// value of the variable that needs to be updated to match, if any.
    pub(crate) fn observe(
        &mut self,
        name: &[u16],
        data: &[u8],
    ) -> Option<(&'static [u16], Vec<u8>)> {
        if name == PLATFORM_LANG_CODES {
            self.platform_lang_codes = ascii_str(data).to_vec();
        } else if name == LANG_CODES {
            self.lang_codes = ascii_str(data).to_vec();
        } else if name == PLATFORM_LANG && !data.is_empty() {
            let best = best_language(&self.platform_lang_codes, ascii_str(data), false)?;
            let index = index_of(&self.platform_lang_codes, best, false)?;
            let lang = lang_at(&self.lang_codes, index, true)?;
            log::info!(
                "Auto update PlatformLang {:?} -> Lang {:?}\n",
                core::str::from_utf8(best),
                core::str::from_utf8(lang)
            );
            let mut value = lang.to_vec();
            value.push(0);
            return Some((LANG, value));
        } else if name == LANG && !data.is_empty() {
            let best = best_language(&self.lang_codes, ascii_str(data), true)?;
            let index = index_of(&self.lang_codes, best, true)?;
            let platform_lang = lang_at(&self.platform_lang_codes, index, false)?;
            log::info!(
                "Auto update Lang {:?} -> PlatformLang {:?}\n",
                core::str::from_utf8(best),
                core::str::from_utf8(platform_lang)
            );
            let mut value = platform_lang.to_vec();
            value.push(0);
            return Some((PLATFORM_LANG, value));
        }
        None
    }
}
