use serde_json::json;

/// A minimal but realistic offer payload, as the remote would serve it.
#[allow(dead_code)]
pub fn offer_json(id: &str, title: &str, html: &str, location: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "numeroOffre": id,
        "intitule": title,
        "datePublication": "2016-03-01T08:30:00.000+0000",
        "salaireTexte": "45 - 55 kEUR",
        "tempsPartiel": false,
        "lieuTexte": location,
        "texteHtml": html,
        "nomCompteEtablissement": "ACME",
        "unusedRemoteField": {"kept": "verbatim"}
    }))
    .unwrap()
}

/// An OpenCage-shaped geocoding response for a resolvable place.
#[allow(dead_code)]
pub fn geocoding_json(city: &str, lat: f64, lon: f64, remaining: i64) -> serde_json::Value {
    json!({
        "rate": {"limit": 2500, "remaining": remaining},
        "results": [{
            "components": {
                "city": city,
                "postcode": "75000",
                "county": city,
                "state": "Ile-de-France",
                "country": "France",
                "country_code": "fr"
            },
            "geometry": {"lat": lat, "lng": lon}
        }]
    })
}

/// A geocoding response with no result.
#[allow(dead_code)]
pub fn geocoding_noresult_json() -> serde_json::Value {
    json!({
        "rate": {"limit": 2500, "remaining": 2000},
        "results": []
    })
}
