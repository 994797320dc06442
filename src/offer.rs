//! Typed access to raw offer payloads. Stored bytes are the verbatim remote
//! JSON; decoding happens on read and unknown fields are never written back.

use crate::error::{JobdeckError, Result};
use crate::salary::parse_salary;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::Deserialize;

/// The subset of the remote offer document the system reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonOffer {
    #[serde(rename = "numeroOffre", default)]
    pub id: String,
    #[serde(rename = "intitule", default)]
    pub title: String,
    #[serde(rename = "datePublication", default)]
    pub date: String,
    #[serde(rename = "salaireTexte", default)]
    pub salary: String,
    #[serde(rename = "tempsPartiel", default)]
    pub partial_time: bool,
    #[serde(rename = "lieuTexte", default)]
    pub location: String,
    #[serde(rename = "lieux", default)]
    pub locations: Vec<JsonOfferLocation>,
    #[serde(rename = "texteHtml", default)]
    pub html: String,
    #[serde(rename = "nomCompteEtablissement", default)]
    pub account: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonOfferLocation {
    #[serde(rename = "libelleLieu", default)]
    pub name: String,
}

/// An offer with derived fields, ready for indexing and display.
#[derive(Debug, Clone)]
pub struct Offer {
    pub id: String,
    pub title: String,
    pub html: String,
    pub account: String,
    pub salary: String,
    pub location: String,
    pub date: DateTime<Utc>,
    pub min_salary: i32,
    pub max_salary: i32,
    pub url: String,
}

/// Publication dates come with milliseconds and a colon-less UTC offset.
fn parse_offer_date(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(d) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.3f%z") {
        return Ok(d.with_timezone(&Utc));
    }
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| JobdeckError::Decode(format!("invalid publication date {:?}: {}", s, e)))
}

pub fn convert_offer(js: &JsonOffer) -> Result<Offer> {
    let date = parse_offer_date(&js.date)?;
    let (min_salary, max_salary) = match parse_salary(&js.salary) {
        Ok(bounds) => bounds,
        Err(e) => {
            tracing::warn!("cannot parse salary {:?}: {}", js.salary, e);
            (0, 0)
        }
    };
    Ok(Offer {
        id: js.id.clone(),
        title: js.title.clone(),
        html: js.html.clone(),
        account: js.account.clone(),
        salary: js.salary.clone(),
        location: js.location.clone(),
        date,
        min_salary,
        max_salary,
        url: format!(
            "https://cadres.apec.fr/offres-emploi-cadres/offre.html?numIdOffre={}",
            js.id
        ),
    })
}

pub fn decode_offer(data: &[u8]) -> Result<JsonOffer> {
    serde_json::from_slice(data).map_err(|e| JobdeckError::Decode(e.to_string()))
}

/// Fingerprint the fields that survive a deletion/republication cycle, so
/// the same posting can be recognized under a new identifier.
pub fn hash_offer(js: &JsonOffer) -> String {
    let mut hasher = Md5::new();
    hasher.update(js.title.as_bytes());
    hasher.update(js.html.as_bytes());
    hasher.update(js.location.as_bytes());
    hasher.update(js.account.as_bytes());
    hasher.update(js.salary.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_and_convert() {
        let data = r#"{
            "numeroOffre": "123",
            "intitule": "Ingénieur logiciel",
            "datePublication": "2016-03-01T08:30:00.000+0000",
            "salaireTexte": "45 - 55 kEUR",
            "lieuTexte": "Paris",
            "texteHtml": "<p>Rust</p>",
            "nomCompteEtablissement": "ACME",
            "ignoredExtraField": {"nested": true}
        }"#
        .as_bytes();
        let js = decode_offer(data).unwrap();
        assert_eq!(js.id, "123");
        let offer = convert_offer(&js).unwrap();
        assert_eq!(offer.date.to_rfc3339(), "2016-03-01T08:30:00+00:00");
        assert_eq!((offer.min_salary, offer.max_salary), (45, 55));
        assert!(offer.url.ends_with("numIdOffre=123"));
    }

    #[test]
    fn hash_depends_on_content_only() {
        let mut a = JsonOffer {
            title: "t".into(),
            html: "h".into(),
            location: "l".into(),
            account: "a".into(),
            salary: "s".into(),
            ..JsonOffer::default()
        };
        let h1 = hash_offer(&a);
        a.id = "other-id".into();
        a.date = "2020-01-01T00:00:00.000+0000".into();
        assert_eq!(hash_offer(&a), h1);
        a.title = "changed".into();
        assert_ne!(hash_offer(&a), h1);
    }
}
