use std::collections::HashMap;

use super::hash::content_hash;
use super::model::{ChangeType, EnrichedListing, Listing};

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedChange {
    pub listing: EnrichedListing,
    pub existing: Option<Listing>,
    pub change: ChangeType,
    pub data_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub changes: Vec<ClassifiedChange>,
    pub products_found: usize,
    pub products_new: usize,
    pub products_updated: usize,
}

impl Classification {
    pub fn count(&self, change: ChangeType) -> usize {
        self.changes.iter().filter(|c| c.change == change).count()
    }
}

/// Classifies one seller's incoming listings against their stored state.
///
/// Output order follows input order.
pub fn classify(
    incoming: Vec<EnrichedListing>,
    existing: &HashMap<String, Listing>,
) -> Classification {
    let products_found = incoming.len();
    let mut products_new = 0;
    let mut products_updated = 0;
    let mut changes = Vec::with_capacity(incoming.len());

    for listing in incoming {
        let data_hash = content_hash(&listing.raw);
        let stored = existing.get(&listing.raw.id).cloned();
        let change = change_for(stored.as_ref(), &listing.raw.seller_phone, &data_hash);
        match change {
            ChangeType::Created => products_new += 1,
            ChangeType::Updated | ChangeType::Reactivated => products_updated += 1,
            ChangeType::Unchanged | ChangeType::Deactivated => {}
        }
        changes.push(ClassifiedChange {
            listing,
            existing: stored,
            change,
            data_hash,
        });
    }

    Classification {
        changes,
        products_found,
        products_new,
        products_updated,
    }
}

fn change_for(stored: Option<&Listing>, seller_phone: &str, data_hash: &str) -> ChangeType {
    let Some(stored) = stored else {
        return ChangeType::Created;
    };
    if !stored.is_active {
        // the inactive -> active transition is itself the event, even with identical content
        return ChangeType::Reactivated;
    }
    // a listing that moved sellers must be rewritten under its new owner
    if stored.seller_phone == seller_phone && stored.data_hash.as_deref() == Some(data_hash) {
        ChangeType::Unchanged
    } else {
        ChangeType::Updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::{ListingAttributes, RawListing};
    use chrono::{TimeZone, Utc};

    fn raw(id: &str, name: &str) -> RawListing {
        RawListing {
            id: id.into(),
            seller_phone: "S".into(),
            name: Some(name.into()),
            ..RawListing::default()
        }
    }

    fn stored(raw: &RawListing, is_active: bool) -> Listing {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Listing {
            id: raw.id.clone(),
            seller_phone: raw.seller_phone.clone(),
            raw_name: raw.name.clone(),
            raw_description: None,
            price: None,
            currency: None,
            availability: None,
            attributes: ListingAttributes::default(),
            data_hash: Some(content_hash(raw)),
            is_active,
            first_seen_at: at,
            last_seen_at: at,
            last_modified_at: Some(at),
        }
    }

    #[test]
    fn classifies_each_lifecycle_case() {
        let same = raw("a", "iPhone 11");
        let renamed_before = raw("b", "iPhone 12");
        let renamed_after = raw("b", "iPhone 12 Mini");
        let dormant = raw("c", "iPhone 13");
        let fresh = raw("d", "iPhone 15");

        let existing: HashMap<_, _> = [
            ("a".to_string(), stored(&same, true)),
            ("b".to_string(), stored(&renamed_before, true)),
            ("c".to_string(), stored(&dormant, false)),
        ]
        .into_iter()
        .collect();

        let result = classify(
            vec![
                EnrichedListing::bare(same),
                EnrichedListing::bare(renamed_after),
                EnrichedListing::bare(dormant),
                EnrichedListing::bare(fresh),
            ],
            &existing,
        );

        let kinds: Vec<ChangeType> = result.changes.iter().map(|c| c.change).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeType::Unchanged,
                ChangeType::Updated,
                ChangeType::Reactivated,
                ChangeType::Created,
            ]
        );
        assert_eq!(result.products_found, 4);
        assert_eq!(result.products_new, 1);
        assert_eq!(result.products_updated, 2);
        assert!(result.changes[3].existing.is_none());
    }

    #[test]
    fn inactive_with_same_hash_is_reactivated_not_unchanged() {
        let listing = raw("a", "iPhone 11");
        let existing: HashMap<_, _> = [("a".to_string(), stored(&listing, false))]
            .into_iter()
            .collect();
        let result = classify(vec![EnrichedListing::bare(listing)], &existing);
        assert_eq!(result.changes[0].change, ChangeType::Reactivated);
        assert_eq!(result.products_updated, 1);
    }

    #[test]
    fn missing_stored_hash_counts_as_update() {
        let listing = raw("a", "iPhone 11");
        let mut row = stored(&listing, true);
        row.data_hash = None;
        let existing: HashMap<_, _> = [("a".to_string(), row)].into_iter().collect();
        let result = classify(vec![EnrichedListing::bare(listing)], &existing);
        assert_eq!(result.changes[0].change, ChangeType::Updated);
    }

    #[test]
    fn enrichment_attributes_do_not_change_classification() {
        let listing = raw("a", "iPhone 11");
        let existing: HashMap<_, _> = [("a".to_string(), stored(&listing, true))]
            .into_iter()
            .collect();
        let enriched = EnrichedListing {
            raw: listing,
            attributes: ListingAttributes {
                model_name: Some("iPhone 11".into()),
                ..ListingAttributes::default()
            },
        };
        let result = classify(vec![enriched], &existing);
        assert_eq!(result.changes[0].change, ChangeType::Unchanged);
        assert_eq!(result.count(ChangeType::Unchanged), 1);
    }

    #[test]
    fn listing_moved_to_another_seller_is_updated() {
        let listing = raw("a", "iPhone 11");
        let mut row = stored(&listing, true);
        row.seller_phone = "OLD".into();
        let existing: HashMap<_, _> = [("a".to_string(), row)].into_iter().collect();
        let result = classify(vec![EnrichedListing::bare(listing)], &existing);
        assert_eq!(result.changes[0].change, ChangeType::Updated);
        assert_eq!(result.products_updated, 1);
    }

    #[test]
    fn empty_scan_yields_zero_counts() {
        let result = classify(Vec::new(), &HashMap::new());
        assert_eq!(result, Classification::default());
    }
}
