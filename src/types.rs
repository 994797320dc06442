use serde::Serialize;

/// A search hit: an offer id with its publication date, RFC 3339 encoded so
/// lexicographic order is chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatedOffer {
    pub date: String,
    pub id: String,
}

/// Sort hits newest first, the only order results are shown in.
pub fn sort_dated_offers(offers: &mut [DatedOffer]) {
    offers.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
}
