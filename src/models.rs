use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name prefix marking references mirrored from the pipeline's own output.
pub const GENERATED_PREFIX: &str = "Generated: ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceImage {
    pub id: String,
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(with = "iso_timestamp")]
    pub uploaded_at: DateTime<Utc>,
}

impl ReferenceImage {
    pub fn is_generated(&self) -> bool {
        self.name.starts_with(GENERATED_PREFIX)
    }

    /// Reference record sharing the generated image's URL and activation flag.
    pub fn mirror_of(image: &GeneratedImage) -> Self {
        Self {
            id: format!("ref-{}", image.id),
            url: image.url.clone(),
            name: format!("{GENERATED_PREFIX}{}", image.prompt),
            is_active: image.is_active,
            uploaded_at: image.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub id: String,
    pub url: String,
    pub prompt: String,
    pub parameters: ImageParameters,
    #[serde(with = "iso_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<MultiViewImages>,
}

/// Extra camera angles of the same sculpture, each a retrieval URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiViewImages {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angled: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Standard,
    High,
    Ultra,
}

/// Descriptive metadata recorded with each generated image. Not interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageParameters {
    #[serde(rename = "type")]
    pub kind: String,
    pub style: String,
    pub description: String,
    pub quality: Quality,
    pub aspect_ratio: String,
}

impl ImageParameters {
    pub fn for_prompt(prompt: &str) -> Self {
        Self {
            kind: "ceramic-model".to_string(),
            style: "realistic".to_string(),
            description: prompt.to_string(),
            quality: Quality::High,
            aspect_ratio: "1:1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    /// Active references guide style only.
    Generate,
    /// The first active reference is modified in place.
    Edit,
    /// A new camera shot of the sculpture in the first active reference.
    Shot,
}

impl GenerationMode {
    pub fn requires_reference(self) -> bool {
        matches!(self, GenerationMode::Edit | GenerationMode::Shot)
    }

    pub fn edit_mode(self) -> bool {
        self.requires_reference()
    }

    pub fn compose_prompt(self, prompt: &str) -> String {
        let prompt = prompt.trim();
        match self {
            GenerationMode::Generate | GenerationMode::Edit => prompt.to_string(),
            GenerationMode::Shot => format!(
                "Show the same sculpture from a new camera angle: {prompt}. Keep its shape, glaze and proportions identical"
            ),
        }
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix, the canonical textual
/// timestamp written to every store.
pub mod iso_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|value| value.with_timezone(&Utc))
    }

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(value) => serializer.serialize_str(&super::format(value)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            Ok(raw.as_deref().and_then(super::parse))
        }
    }
}
