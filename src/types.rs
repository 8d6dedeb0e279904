use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

const DOC_DATE_FORMAT: &[FormatItem<'static>] = format_description!(
    "[month repr:short] [day padding:zero], [year] [hour padding:zero]:[minute padding:zero]"
);

/// A flat field mapping as exchanged with the remote document store.
pub type Record = BTreeMap<String, FieldValue>;

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Store-native instant, kept as unix milliseconds.
    Timestamp(i64),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn timestamp(instant: OffsetDateTime) -> Self {
        FieldValue::Timestamp(unix_millis(instant))
    }

    pub fn optional_text(value: Option<&str>) -> Self {
        value.map(FieldValue::text).unwrap_or(FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            FieldValue::Float(value) => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_instant(&self) -> Option<OffsetDateTime> {
        match self {
            FieldValue::Timestamp(millis) => from_unix_millis(*millis),
            _ => None,
        }
    }

    pub fn as_text_list(&self) -> Option<Vec<String>> {
        match self {
            FieldValue::List(items) => Some(
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Ordering used when a collection is sorted by this field.
    /// Values of different kinds sort by kind; nulls come first.
    pub fn order(&self, other: &FieldValue) -> Ordering {
        use FieldValue::*;
        match (self, other) {
            (Timestamp(a), Timestamp(b)) | (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Text(a), Text(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Bool(_) => 1,
            FieldValue::Int(_) | FieldValue::Float(_) => 2,
            FieldValue::Timestamp(_) => 3,
            FieldValue::Text(_) => 4,
            FieldValue::List(_) => 5,
        }
    }
}

/// A record together with the identifier the store assigned to it.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub fields: Record,
}

pub fn unix_millis(instant: OffsetDateTime) -> i64 {
    (instant.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_unix_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).ok()
}

/// Current time truncated to the precision the store keeps.
pub fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    from_unix_millis(unix_millis(now)).unwrap_or(now)
}

// ============================================
// Messages
// ============================================

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Assigned by the store once the message is persisted.
    pub id: Option<String>,
    pub content: String,
    pub is_user: bool,
    pub timestamp: OffsetDateTime,
    pub subject: Option<String>,
    pub attachments: Option<Vec<String>>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(content, true)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(content, false)
    }

    fn new(content: impl Into<String>, is_user: bool) -> Self {
        Self {
            id: None,
            content: content.into(),
            is_user,
            timestamp: now(),
            subject: None,
            attachments: None,
        }
    }

    pub fn to_record(&self) -> Record {
        let attachments = self
            .attachments
            .as_ref()
            .map(|ids| FieldValue::List(ids.iter().map(FieldValue::text).collect()))
            .unwrap_or(FieldValue::Null);

        Record::from([
            ("content".to_string(), FieldValue::text(&self.content)),
            ("isUser".to_string(), FieldValue::Bool(self.is_user)),
            (
                "timestamp".to_string(),
                FieldValue::timestamp(self.timestamp),
            ),
            (
                "subject".to_string(),
                FieldValue::optional_text(self.subject.as_deref()),
            ),
            ("attachments".to_string(), attachments),
        ])
    }

    /// Builds a message from a stored record. Missing or ill-typed fields
    /// fall back to empty content, assistant origin and the current time.
    pub fn from_stored(record: &StoredRecord) -> Self {
        let fields = &record.fields;
        Self {
            id: Some(record.id.clone()),
            content: fields
                .get("content")
                .and_then(FieldValue::as_str)
                .unwrap_or_default()
                .to_string(),
            is_user: fields
                .get("isUser")
                .and_then(FieldValue::as_bool)
                .unwrap_or(false),
            timestamp: fields
                .get("timestamp")
                .and_then(FieldValue::as_instant)
                .unwrap_or_else(now),
            subject: fields
                .get("subject")
                .and_then(FieldValue::as_str)
                .map(str::to_string),
            attachments: fields.get("attachments").and_then(FieldValue::as_text_list),
        }
    }
}

// ============================================
// Documents
// ============================================

/// Identity of a document within the catalog: its file name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum UploadState {
    LocalOnly,
    Uploading { progress: f64 },
    Uploaded,
    Failed { reason: String },
}

impl UploadState {
    pub fn is_uploading(&self) -> bool {
        matches!(self, UploadState::Uploading { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: Option<String>,
    pub name: String,
    pub local_path: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub size: u64,
    pub created_at: OffsetDateTime,
    pub upload_state: UploadState,
    pub extracted_text: Option<String>,
    pub embeddings: Option<Vec<f64>>,
    pub summary: Option<String>,
}

impl Document {
    /// A freshly imported file that has not been uploaded yet.
    pub fn local(
        name: impl Into<String>,
        path: PathBuf,
        size: u64,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            local_path: Some(path),
            remote_url: None,
            size,
            created_at,
            upload_state: UploadState::LocalOnly,
            extracted_text: None,
            embeddings: None,
            summary: None,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(&self.name)
    }

    /// Metadata record written after the blob upload succeeds.
    pub fn to_metadata_record(&self, owner: &str, storage_path: &str) -> Record {
        let mut record = Record::from([
            ("name".to_string(), FieldValue::text(&self.name)),
            ("size".to_string(), FieldValue::Int(self.size as i64)),
            ("date".to_string(), FieldValue::timestamp(self.created_at)),
            ("owner".to_string(), FieldValue::text(owner)),
            ("storagePath".to_string(), FieldValue::text(storage_path)),
            (
                "isUploaded".to_string(),
                FieldValue::Bool(self.remote_url.is_some()),
            ),
        ]);
        if let Some(url) = &self.remote_url {
            record.insert("remoteURL".to_string(), FieldValue::text(url));
        }
        if let Some(text) = &self.extracted_text {
            record.insert("extractedText".to_string(), FieldValue::text(text));
        }
        if let Some(summary) = &self.summary {
            record.insert("summary".to_string(), FieldValue::text(summary));
        }
        if let Some(embeddings) = &self.embeddings {
            record.insert(
                "embeddings".to_string(),
                FieldValue::List(embeddings.iter().copied().map(FieldValue::Float).collect()),
            );
        }
        record
    }

    /// Rebuilds a document from its metadata record. Records without a
    /// name or a remote URL have no content source and are skipped.
    pub fn from_metadata(record: &StoredRecord) -> Option<Self> {
        let fields = &record.fields;
        let name = fields.get("name").and_then(FieldValue::as_str)?.to_string();
        let remote_url = fields
            .get("remoteURL")
            .and_then(FieldValue::as_str)?
            .to_string();
        let embeddings = match fields.get("embeddings") {
            Some(FieldValue::List(items)) => Some(
                items
                    .iter()
                    .filter_map(|item| match item {
                        FieldValue::Float(value) => Some(*value),
                        FieldValue::Int(value) => Some(*value as f64),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        };

        Some(Self {
            id: Some(record.id.clone()),
            name,
            local_path: None,
            remote_url: Some(remote_url),
            size: fields
                .get("size")
                .and_then(FieldValue::as_i64)
                .unwrap_or(0)
                .max(0) as u64,
            created_at: fields
                .get("date")
                .and_then(FieldValue::as_instant)
                .unwrap_or_else(now),
            upload_state: UploadState::Uploaded,
            extracted_text: fields
                .get("extractedText")
                .and_then(FieldValue::as_str)
                .map(str::to_string),
            embeddings,
            summary: fields
                .get("summary")
                .and_then(FieldValue::as_str)
                .map(str::to_string),
        })
    }

    pub fn formatted_size(&self) -> String {
        const KB: f64 = 1024.0;
        const MB: f64 = KB * 1024.0;
        let size = self.size as f64;
        if size >= MB {
            format!("{:.1} MB", size / MB)
        } else {
            format!("{:.0} KB", (size / KB).ceil())
        }
    }

    pub fn formatted_date(&self) -> String {
        self.created_at
            .format(DOC_DATE_FORMAT)
            .unwrap_or_else(|_| self.created_at.to_string())
    }

    pub fn status_text(&self) -> String {
        match &self.upload_state {
            UploadState::Uploaded => "Synced".to_string(),
            UploadState::Uploading { progress } => {
                format!("Upload: {}%", (progress * 100.0).floor() as u32)
            }
            UploadState::LocalOnly => "Local".to_string(),
            UploadState::Failed { reason } => format!("Failed: {reason}"),
        }
    }
}
