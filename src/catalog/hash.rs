use sha2::{Digest, Sha256};
use std::fmt::Write;

use super::model::RawListing;

/// Digest over the fields that identify a listing's visible content.
///
/// Field order is fixed: id, name, description, price, availability, currency.
/// Absent fields contribute an empty segment so the layout stays positional.
pub fn content_hash(listing: &RawListing) -> String {
    let base = [
        listing.id.clone(),
        listing.name.clone().unwrap_or_default(),
        listing.description.clone().unwrap_or_default(),
        listing.price_text(),
        listing.availability_text().unwrap_or_default(),
        listing.currency.clone().unwrap_or_default(),
    ]
    .join("|");
    sha256_hex(&base)
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing() -> RawListing {
        RawListing {
            id: "p-1".into(),
            seller_phone: "919900000001".into(),
            name: Some("iPhone 14 Pro".into()),
            description: Some("128GB, boxed".into()),
            price_raw: Some(json!(64000000)),
            currency: Some("INR".into()),
            availability: Some(json!("in stock")),
            ..RawListing::default()
        }
    }

    #[test]
    fn hash_is_stable_hex_sha256() {
        let first = content_hash(&listing());
        let second = content_hash(&listing());
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_matches_pipe_joined_digest() {
        let expected = sha256_hex("p-1|iPhone 14 Pro|128GB, boxed|64000000|in stock|INR");
        assert_eq!(content_hash(&listing()), expected);
    }

    #[test]
    fn seller_metadata_and_url_do_not_affect_hash() {
        let mut other = listing();
        other.seller_name = Some("Phone Hub".into());
        other.product_url = Some("https://example.com/p-1".into());
        assert_eq!(content_hash(&listing()), content_hash(&other));
    }

    #[test]
    fn each_content_field_changes_hash() {
        let base = content_hash(&listing());
        let mut renamed = listing();
        renamed.name = Some("iPhone 14 Pro Max".into());
        let mut repriced = listing();
        repriced.price_raw = Some(json!(61000000));
        let mut sold_out = listing();
        sold_out.availability = None;
        assert_ne!(base, content_hash(&renamed));
        assert_ne!(base, content_hash(&repriced));
        assert_ne!(base, content_hash(&sold_out));
    }

    #[test]
    fn string_and_numeric_price_hash_alike() {
        let mut textual = listing();
        textual.price_raw = Some(json!("64000000"));
        assert_eq!(content_hash(&listing()), content_hash(&textual));
    }
}
