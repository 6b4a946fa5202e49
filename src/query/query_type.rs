use std::fmt;

/// Classification of an outgoing statement.
///
/// The caller already knows what kind of statement it is about to run, so the
/// tag travels with the SQL instead of being sniffed out of the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Select,
    Insert,
    Update,
    /// DDL: CREATE, ALTER, DROP, TRUNCATE and friends
    StructuralChange,
    Other,
}

impl QueryType {
    /// Statements that change table contents or shape
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, QueryType::Insert | QueryType::Update | QueryType::StructuralChange)
    }

    /// Parse the short tag used by the command line front end.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "select" | "read" => Some(QueryType::Select),
            "insert" => Some(QueryType::Insert),
            "update" | "delete" => Some(QueryType::Update),
            "ddl" | "structure" => Some(QueryType::StructuralChange),
            "other" => Some(QueryType::Other),
            _ => None,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryType::Select => "select",
            QueryType::Insert => "insert",
            QueryType::Update => "update",
            QueryType::StructuralChange => "structure",
            QueryType::Other => "other",
        };
        f.write_str(name)
    }
}
