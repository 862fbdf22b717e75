use sha2::{Digest, Sha256};

use crate::{HealingId, Locator, SelectorId};

/// Derive the identifier of a healing attempt from its selector and page snapshot.
///
/// The selector id is length-prefixed before the page content is appended, so the
/// hashed byte stream is unambiguous for every distinct `(selector_id, page_content)`.
#[must_use]
pub fn derive_healing_id(selector_id: &SelectorId, page_content: &str) -> HealingId {
    let mut hasher = Sha256::new();
    update_framed(&mut hasher, selector_id.as_str());
    hasher.update(page_content.as_bytes());
    let digest = hasher.finalize();
    HealingId(format!("{digest:x}"))
}

/// Source of stable selector identifiers.
pub trait SelectorIdentityProvider {
    fn derive_selector_id(
        &self,
        locator: &Locator,
        url: &str,
        command: &str,
        use_url_as_key: bool,
    ) -> SelectorId;
}

/// SHA-256 over the framed locator strategy, value, command and (optionally) URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestSelectorIdentity;

impl SelectorIdentityProvider for DigestSelectorIdentity {
    fn derive_selector_id(
        &self,
        locator: &Locator,
        url: &str,
        command: &str,
        use_url_as_key: bool,
    ) -> SelectorId {
        let mut hasher = Sha256::new();
        update_framed(&mut hasher, &locator.strategy);
        update_framed(&mut hasher, &locator.value);
        update_framed(&mut hasher, command);
        if use_url_as_key {
            hasher.update([1_u8]);
            update_framed(&mut hasher, url);
        } else {
            hasher.update([0_u8]);
        }
        let digest = hasher.finalize();
        SelectorId(format!("{digest:x}"))
    }
}

fn update_framed(hasher: &mut Sha256, value: &str) {
    let len = u64::try_from(value.len()).unwrap_or(u64::MAX);
    hasher.update(len.to_be_bytes());
    hasher.update(value.as_bytes());
}
