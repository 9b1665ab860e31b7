use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

pub const MAPS_PLACE_URL: &str = "https://www.google.com/maps/place/?q=place_id:";

/// `", 5000 Namur"` inside a formatted address: 4-5 digit postal code then the city.
const POSTAL_CITY_PATTERN: &str = r",\s*(\d{4,5})\s+([^,]+)";

/// One hit of a text search, as the upstream API returns it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPlace {
    #[serde(default)]
    pub place_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub user_ratings_total: Option<u64>,
    #[serde(default)]
    pub types: Vec<String>,
}

/// Canonical place. The public URL is not stored; it is always `maps_url(&id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceRecord {
    pub id: String,
    pub name: String,
    pub address: String,
    pub city: String,
    pub postal_code: String,
    pub rating: Option<f64>,
    pub review_count: Option<u64>,
    pub types: Vec<String>,
}

impl PlaceRecord {
    pub fn url(&self) -> String {
        maps_url(&self.id)
    }
}

pub fn maps_url(place_id: &str) -> String {
    format!("{}{}", MAPS_PLACE_URL, place_id)
}

/// Inverse of [`maps_url`]. Used to recover identifiers from a persisted table.
pub fn place_id_from_url(url: &str) -> Option<&str> {
    url.strip_prefix(MAPS_PLACE_URL).filter(|id| !id.is_empty())
}

/// Map a raw hit to a record. Missing fields become empty strings or `None`;
/// a missing identifier yields an empty `id`, which callers must reject.
pub fn normalize(raw: &RawPlace) -> PlaceRecord {
    let address = raw
        .formatted_address
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_string();
    let (postal_code, city) = parse_address(&address);

    PlaceRecord {
        id: raw.place_id.as_deref().unwrap_or_default().trim().to_string(),
        name: raw.name.as_deref().unwrap_or_default().trim().to_string(),
        city,
        postal_code,
        address,
        rating: raw.rating,
        review_count: raw.user_ratings_total,
        types: raw.types.clone(),
    }
}

/// Best-effort `(postal_code, city)` from a free-text address; both empty when
/// no `", NNNN City"` group is present.
pub fn parse_address(address: &str) -> (String, String) {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(POSTAL_CITY_PATTERN).expect("static pattern"));

    match re.captures(address) {
        Some(caps) => (caps[1].trim().to_string(), caps[2].trim().to_string()),
        None => (String::new(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn belgian_address() {
        let (postal, city) = parse_address("12 Rue X, 5000 Namur, Belgium");
        assert_eq!(postal, "5000");
        assert_eq!(city, "Namur");
    }

    #[test]
    fn five_digit_code_and_multiword_city() {
        let (postal, city) = parse_address("3 Place du Marché, 75001 Paris 1er Arrondissement, France");
        assert_eq!(postal, "75001");
        assert_eq!(city, "Paris 1er Arrondissement");
    }

    #[test]
    fn address_without_postal_segment() {
        assert_eq!(parse_address("Chaussée de Louvain, Belgium"), (String::new(), String::new()));
        assert_eq!(parse_address("Namur"), (String::new(), String::new()));
        assert_eq!(parse_address(""), (String::new(), String::new()));
    }

    #[test]
    fn url_round_trips_identifier() {
        let url = maps_url("abc");
        assert_eq!(url, "https://www.google.com/maps/place/?q=place_id:abc");
        assert_eq!(place_id_from_url(&url), Some("abc"));
        assert_eq!(place_id_from_url("https://example.com/abc"), None);
        assert_eq!(place_id_from_url(MAPS_PLACE_URL), None);
    }

    #[test]
    fn normalize_full_hit() {
        let raw: RawPlace = serde_json::from_str(
            r#"{
                "place_id": "abc",
                "name": "Ferme X",
                "formatted_address": "1 Rue Y, 5000 Namur, Belgium",
                "rating": 4.6,
                "user_ratings_total": 87,
                "types": ["store", "point_of_interest"]
            }"#,
        )
        .unwrap();
        let rec = normalize(&raw);
        assert_eq!(rec.id, "abc");
        assert_eq!(rec.name, "Ferme X");
        assert_eq!(rec.city, "Namur");
        assert_eq!(rec.postal_code, "5000");
        assert_eq!(rec.rating, Some(4.6));
        assert_eq!(rec.review_count, Some(87));
        assert_eq!(rec.types, vec!["store", "point_of_interest"]);
        assert_eq!(rec.url(), "https://www.google.com/maps/place/?q=place_id:abc");
    }

    #[test]
    fn normalize_sparse_hit_never_fails() {
        let raw: RawPlace = serde_json::from_str(r#"{"name": "Sans adresse"}"#).unwrap();
        let rec = normalize(&raw);
        assert!(rec.id.is_empty());
        assert_eq!(rec.name, "Sans adresse");
        assert!(rec.address.is_empty());
        assert!(rec.city.is_empty());
        assert!(rec.rating.is_none());
        assert!(rec.types.is_empty());
    }
}
