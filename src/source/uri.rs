//! Data source URIs.
//!
//! A URI names a value in the source tree: `source:station.table.column`,
//! where the column may carry comma-separated integer subscripts in
//! parentheses. Breakdown is a total function; anything unparseable
//! simply yields an empty breakdown.

use std::fmt;

/// What a URI component names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriPartKind {
    Source,
    Station,
    Table,
    Column,
}

/// One component of a broken-down URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriPart {
    pub name: String,
    pub kind: UriPartKind,
}

/// A parsed source URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUri {
    raw: String,
}

impl SourceUri {
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
        }
    }

    /// The raw URI text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The source name before the colon; the whole text when no colon
    /// is present (a source-only URI).
    #[must_use]
    pub fn source_name(&self) -> &str {
        match self.raw.split_once(':') {
            Some((source, _)) => source,
            None => &self.raw,
        }
    }

    /// True when the URI names only a source.
    #[must_use]
    pub fn is_source_only(&self) -> bool {
        !self.raw.contains(':')
    }

    /// Everything after the source name.
    #[must_use]
    pub fn remainder(&self) -> &str {
        match self.raw.split_once(':') {
            Some((_, rest)) => rest,
            None => "",
        }
    }

    /// Subscripts from a trailing `(i,j,...)` on the column.
    #[must_use]
    pub fn subscripts(&self) -> Vec<u32> {
        let Some(open) = self.raw.rfind('(') else {
            return Vec::new();
        };
        let Some(close) = self.raw.rfind(')') else {
            return Vec::new();
        };
        if close < open {
            return Vec::new();
        }
        self.raw[open + 1..close]
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect()
    }

    /// Breaks the URI into ordered (name, kind) parts. Invalid text
    /// yields an empty vector rather than an error.
    #[must_use]
    pub fn breakdown(&self) -> Vec<UriPart> {
        let mut parts = Vec::new();
        let (source, rest) = match self.raw.split_once(':') {
            Some((source, rest)) => (source, rest),
            None => (self.raw.as_str(), ""),
        };
        if source.is_empty() {
            return parts;
        }
        parts.push(UriPart {
            name: source.to_string(),
            kind: UriPartKind::Source,
        });
        if rest.is_empty() {
            return parts;
        }
        // Strip subscripts before splitting on dots so a subscript
        // list can never smuggle in separators.
        let without_subscripts = match rest.find('(') {
            Some(index) => &rest[..index],
            None => rest,
        };
        let mut pieces = without_subscripts.split('.');
        let station = pieces.next().unwrap_or("");
        if station.is_empty() {
            parts.clear();
            return parts;
        }
        parts.push(UriPart {
            name: station.to_string(),
            kind: UriPartKind::Station,
        });
        if let Some(table) = pieces.next() {
            if table.is_empty() {
                parts.clear();
                return parts;
            }
            parts.push(UriPart {
                name: table.to_string(),
                kind: UriPartKind::Table,
            });
        }
        // Any remaining dotted pieces belong to the column name, which
        // may itself be dotted for nested structures.
        let column: Vec<&str> = pieces.collect();
        if !column.is_empty() {
            let column = column.join(".");
            if column.is_empty() {
                parts.clear();
                return parts;
            }
            parts.push(UriPart {
                name: column,
                kind: UriPartKind::Column,
            });
        }
        parts
    }

    /// The station part, if the breakdown reaches it.
    #[must_use]
    pub fn station(&self) -> Option<String> {
        self.breakdown()
            .into_iter()
            .find(|part| part.kind == UriPartKind::Station)
            .map(|part| part.name)
    }

    /// The table part, if the breakdown reaches it.
    #[must_use]
    pub fn table(&self) -> Option<String> {
        self.breakdown()
            .into_iter()
            .find(|part| part.kind == UriPartKind::Table)
            .map(|part| part.name)
    }

    /// The column part, if the breakdown reaches it.
    #[must_use]
    pub fn column(&self) -> Option<String> {
        self.breakdown()
            .into_iter()
            .find(|part| part.kind == UriPartKind::Column)
            .map(|part| part.name)
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        out.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_uri_breaks_down() {
        let uri = SourceUri::new("src:stn.tbl.temp");
        let parts = uri.breakdown();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].kind, UriPartKind::Source);
        assert_eq!(parts[0].name, "src");
        assert_eq!(parts[1].kind, UriPartKind::Station);
        assert_eq!(parts[2].kind, UriPartKind::Table);
        assert_eq!(parts[3].kind, UriPartKind::Column);
        assert_eq!(parts[3].name, "temp");
    }

    #[test]
    fn dotted_column_names_stay_whole() {
        let uri = SourceUri::new("src:stn.tbl.block.inner");
        assert_eq!(uri.column().unwrap(), "block.inner");
    }

    #[test]
    fn subscripts_parse() {
        let uri = SourceUri::new("src:stn.tbl.values(2,3)");
        assert_eq!(uri.subscripts(), vec![2, 3]);
        assert_eq!(uri.column().unwrap(), "values");
    }

    #[test]
    fn source_only_uri() {
        let uri = SourceUri::new("src");
        assert!(uri.is_source_only());
        let parts = uri.breakdown();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, UriPartKind::Source);
    }

    #[test]
    fn invalid_uris_break_down_empty() {
        assert!(SourceUri::new("").breakdown().is_empty());
        assert!(SourceUri::new(":stn.tbl").breakdown().is_empty());
        assert!(SourceUri::new("src:.tbl").breakdown().is_empty());
    }
}
