use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::storage::repository::NewListing;

/// `{ "results": [...] }` envelope used by the collection endpoints. Items are
/// kept raw so one malformed record can be skipped without failing the page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Page {
    #[serde(default, alias = "result")]
    pub results: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingImages {
    pub original: Option<String>,
    pub large: Option<String>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(alias = "name")]
    pub title: Option<String>,
    pub address: Option<String>,
    pub status: Option<String>,
    #[serde(alias = "roomType")]
    pub property_type: Option<String>,
    pub thumbnail_url: Option<String>,
    pub images: Option<ListingImages>,
}

impl Listing {
    /// Highest resolution available: original, then large, then thumbnail.
    pub fn highres_url(&self) -> Option<&str> {
        let images = self.images.as_ref();
        [
            images.and_then(|i| i.original.as_deref()),
            images.and_then(|i| i.large.as_deref()),
            images.and_then(|i| i.thumbnail.as_deref()),
            self.thumbnail_url.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|url| !url.is_empty())
    }

    pub fn thumbnail(&self) -> Option<&str> {
        [
            self.thumbnail_url.as_deref(),
            self.images.as_ref().and_then(|i| i.thumbnail.as_deref()),
        ]
        .into_iter()
        .flatten()
        .find(|url| !url.is_empty())
        .or_else(|| self.highres_url())
    }

    pub fn to_new_listing(&self, raw: &Value) -> NewListing {
        NewListing {
            id: self.id.clone(),
            title: self.title.clone(),
            address: self.address.clone(),
            status: self.status.clone(),
            property_type: self.property_type.clone(),
            thumbnail_url: self.thumbnail().map(str::to_string),
            highres_url: self.highres_url().map(str::to_string),
            raw_data: raw.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, alias = "listingMapId", deserialize_with = "de_opt_id")]
    pub listing_id: Option<String>,
    pub guest_name: Option<String>,
    #[serde(alias = "arrivalDate")]
    pub check_in: Option<String>,
    #[serde(alias = "departureDate")]
    pub check_out: Option<String>,
    pub status: Option<String>,
}

/// Best-effort id of a raw record, used when the record itself fails validation.
pub fn raw_id(raw: &Value) -> Option<String> {
    match raw.get("id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Int(i64),
    Str(String),
}

fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let id = match IdRepr::deserialize(d)? {
        IdRepr::Int(n) => n.to_string(),
        IdRepr::Str(s) => s.trim().to_string(),
    };
    if id.is_empty() {
        return Err(de::Error::custom("empty id"));
    }
    Ok(id)
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<IdRepr>::deserialize(d)? {
        None => None,
        Some(IdRepr::Int(n)) => Some(n.to_string()),
        Some(IdRepr::Str(s)) if s.trim().is_empty() => None,
        Some(IdRepr::Str(s)) => Some(s.trim().to_string()),
    })
}
