//! Image records and queries.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::ServiceError;

/// Lifecycle status of an image record.
///
/// Serialized as `"preparing"`, `"OK"`, or the free-form failure text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageStatus {
    Preparing,
    Ok,
    Failed(String),
}

impl ImageStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ImageStatus::Preparing => "preparing",
            ImageStatus::Ok => "OK",
            ImageStatus::Failed(msg) => msg,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ImageStatus::Ok)
    }
}

impl From<&str> for ImageStatus {
    fn from(s: &str) -> Self {
        match s {
            "OK" => ImageStatus::Ok,
            "preparing" => ImageStatus::Preparing,
            other => ImageStatus::Failed(other.to_string()),
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ImageStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ImageStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ImageStatus::from(s.as_str()))
    }
}

/// A validated image record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    /// OS family, e.g. `centos`.
    pub name: String,
    pub version: String,
    /// File name of the backing ISO inside the ISO directory.
    pub iso: String,
    pub status: ImageStatus,
}

impl Image {
    /// A fresh record with a random id.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        iso: impl Into<String>,
        status: ImageStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: version.into(),
            iso: iso.into(),
            status,
        }
    }
}

/// Image fields as received from untrusted input.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawImage {
    pub id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub iso: Option<String>,
    pub status: Option<String>,
}

impl From<&Image> for RawImage {
    fn from(img: &Image) -> Self {
        Self {
            id: Some(img.id.to_string()),
            name: Some(img.name.clone()),
            version: Some(img.version.clone()),
            iso: Some(img.iso.clone()),
            status: Some(img.status.as_str().to_string()),
        }
    }
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, String> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(format!("{field} can not be empty value")),
    }
}

impl TryFrom<&RawImage> for Image {
    type Error = ServiceError;

    fn try_from(raw: &RawImage) -> Result<Self, Self::Error> {
        let checked = (|| {
            let id = required("id", &raw.id)?;
            let name = required("name", &raw.name)?;
            let version = required("version", &raw.version)?;
            let iso = required("iso", &raw.iso)?;
            let status = required("status", &raw.status)?;
            let id = Uuid::parse_str(id).map_err(|_| "wrong id format".to_string())?;
            Ok::<_, String>(Image {
                id,
                name: name.to_string(),
                version: version.to_string(),
                iso: iso.to_string(),
                status: ImageStatus::from(status),
            })
        })();

        checked.map_err(|reason| {
            tracing::error!("bad image to add: {reason}");
            ServiceError::bad_request("Invalid image parameters specified")
        })
    }
}

/// True when every field is present and non-empty and `id` is a UUID.
pub fn validate_image_object(raw: &RawImage) -> bool {
    Image::try_from(raw).is_ok()
}

/// Partial predicate over image records. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageQuery {
    pub id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub iso: Option<String>,
    pub status: Option<String>,
}

impl ImageQuery {
    pub fn name_version(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            version: Some(version.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.name.is_none()
            && self.version.is_none()
            && self.iso.is_none()
            && self.status.is_none()
    }

    pub fn matches(&self, image: &Image) -> bool {
        let id_ok = match &self.id {
            None => true,
            Some(q) => Uuid::parse_str(q).map(|id| id == image.id).unwrap_or(false),
        };
        id_ok
            && field_matches(&self.name, &image.name)
            && field_matches(&self.version, &image.version)
            && field_matches(&self.iso, &image.iso)
            && field_matches(&self.status, image.status.as_str())
    }
}

fn field_matches(query: &Option<String>, value: &str) -> bool {
    query.as_deref().is_none_or(|q| q == value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawImage {
        RawImage {
            id: Some("b6b3e3be-c799-4af4-86c8-09a99d3aa7c7".into()),
            name: Some("centos".into()),
            version: Some("7.0".into()),
            iso: Some("centos-7.0.iso".into()),
            status: Some("preparing".into()),
        }
    }

    #[test]
    fn accepts_well_formed_image() {
        let img = Image::try_from(&raw()).unwrap();
        assert_eq!(img.name, "centos");
        assert_eq!(img.status, ImageStatus::Preparing);
        assert!(validate_image_object(&raw()));
    }

    #[test]
    fn rejects_bad_uuid() {
        let mut r = raw();
        r.id = Some("not-a-uuid".into());
        assert!(!validate_image_object(&r));
        assert_eq!(
            Image::try_from(&r).unwrap_err(),
            ServiceError::bad_request("Invalid image parameters specified")
        );
    }

    #[test]
    fn rejects_missing_or_empty_fields() {
        let mut r = raw();
        r.iso = None;
        assert!(!validate_image_object(&r));

        let mut r = raw();
        r.version = Some(String::new());
        assert!(!validate_image_object(&r));
    }

    #[test]
    fn status_round_trips_through_json() {
        let img = Image::new("centos", "7.0", "c.iso", ImageStatus::Ok);
        let json = serde_json::to_value(&img).unwrap();
        assert_eq!(json["status"], "OK");

        let failed: ImageStatus = serde_json::from_str("\"error: Fail mounting ISO\"").unwrap();
        assert_eq!(
            failed,
            ImageStatus::Failed("error: Fail mounting ISO".into())
        );
    }

    #[test]
    fn query_matching() {
        let img = Image::try_from(&raw()).unwrap();
        assert!(ImageQuery::default().matches(&img));
        assert!(ImageQuery::name_version("centos", "7.0").matches(&img));
        assert!(!ImageQuery::name_version("centos", "8.0").matches(&img));

        let by_id = ImageQuery {
            id: Some("B6B3E3BE-C799-4AF4-86C8-09A99D3AA7C7".into()),
            ..Default::default()
        };
        assert!(by_id.matches(&img));

        let by_status = ImageQuery {
            status: Some("OK".into()),
            ..Default::default()
        };
        assert!(!by_status.matches(&img));
    }
}
