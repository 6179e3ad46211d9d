//! Record types stored in reference tables.
//!
//! Two record kinds exist, each forming its own ordered keyspace inside a
//! table:
//!
//! - [`RefRecord`] — the current value of one reference: a direct object
//!   id, a direct id with a peeled target, a symbolic reference, or a
//!   deletion tombstone. Keyed by name.
//! - [`LogRecord`] — one historical reflog entry (or a log deletion
//!   marker). Keyed by `(name, update_index)` with the index descending,
//!   so the most recent entry for a name is encountered first.
//!
//! Every record carries the `update_index` of the write that produced it.
//! Update indices increase monotonically across the whole stack; a table
//! file covers one contiguous `[min, max]` interval of them.
//!
//! Object ids are raw digest bytes whose width is fixed by the stack's
//! [`HashId`]; tables written with one hash id cannot be read as another.

pub(crate) mod encoding_impls;

// ------------------------------------------------------------------------------------------------
// HashId
// ------------------------------------------------------------------------------------------------

/// Identifies the object-name digest used by a stack.
///
/// The id is stamped into every table header; the on-disk format is
/// incompatible across ids, so opening a table with a mismatching hash id
/// fails with a format error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashId {
    /// SHA-1 object names (20 bytes).
    Sha1,
    /// SHA-256 object names (32 bytes).
    Sha256,
}

impl HashId {
    /// The u32 format id written into table headers.
    pub const fn format_id(self) -> u32 {
        match self {
            // ASCII "sha1" / "s256".
            HashId::Sha1 => 0x7368_6131,
            HashId::Sha256 => 0x7332_3536,
        }
    }

    /// Byte width of an object id under this hash.
    pub const fn object_len(self) -> usize {
        match self {
            HashId::Sha1 => 20,
            HashId::Sha256 => 32,
        }
    }

    /// Reverse of [`HashId::format_id`].
    pub fn from_format_id(id: u32) -> Option<Self> {
        match id {
            0x7368_6131 => Some(HashId::Sha1),
            0x7332_3536 => Some(HashId::Sha256),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Ref records
// ------------------------------------------------------------------------------------------------

/// The value half of a reference binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    /// Deletion tombstone. Shadows any value for the same name held in
    /// older tables.
    Deletion,

    /// A direct binding to one object id.
    Direct(Vec<u8>),

    /// A direct binding plus the peeled object id it ultimately points
    /// at (annotated tags).
    DirectPeeled {
        /// Object id of the reference itself.
        id: Vec<u8>,
        /// Object id the annotated tag peels to.
        peeled: Vec<u8>,
    },

    /// A symbolic reference to another reference name.
    Symbolic(String),
}

impl RefValue {
    /// Returns `true` for the deletion tombstone.
    pub fn is_deletion(&self) -> bool {
        matches!(self, RefValue::Deletion)
    }
}

/// One reference binding as stored in a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    /// Fully qualified reference name.
    pub name: String,

    /// Update index of the write that produced this binding.
    pub update_index: u64,

    /// The bound value, or a tombstone.
    pub value: RefValue,
}

impl RefRecord {
    /// Creates a deletion tombstone for `name`.
    pub fn deletion(name: impl Into<String>, update_index: u64) -> Self {
        Self {
            name: name.into(),
            update_index,
            value: RefValue::Deletion,
        }
    }

    /// Creates a direct binding for `name`.
    pub fn direct(name: impl Into<String>, update_index: u64, id: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            update_index,
            value: RefValue::Direct(id.into()),
        }
    }

    /// Creates a symbolic binding for `name`.
    pub fn symbolic(
        name: impl Into<String>,
        update_index: u64,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            update_index,
            value: RefValue::Symbolic(target.into()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Log records
// ------------------------------------------------------------------------------------------------

/// The payload of a live reflog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogUpdate {
    /// Object id before the update. All zeroes for a creation.
    pub old_id: Vec<u8>,

    /// Object id after the update. All zeroes for a deletion.
    pub new_id: Vec<u8>,

    /// Committer name.
    pub committer: String,

    /// Committer email address.
    pub email: String,

    /// Wall-clock time of the update, seconds since the UNIX epoch.
    pub time: u64,

    /// Timezone offset in minutes east of UTC.
    pub tz_offset: i16,

    /// Reflog message. Normalized to carry exactly one trailing newline
    /// unless the stack was opened with `exact_log_message`.
    pub message: String,
}

/// One reflog entry as stored in a table.
///
/// `update` is `None` for a log deletion marker, which shadows the entry
/// with the same `(name, update_index)` key in older tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Reference name this entry belongs to.
    pub name: String,

    /// Update index of the entry. Part of the key: log records sort by
    /// `(name ASC, update_index DESC)`.
    pub update_index: u64,

    /// The entry payload, or `None` for a deletion marker.
    pub update: Option<LogUpdate>,
}

impl LogRecord {
    /// Returns `true` for a log deletion marker.
    pub fn is_deletion(&self) -> bool {
        self.update.is_none()
    }
}
