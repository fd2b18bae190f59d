//! Reference parsing: the three shapes from the glossary — `name`,
//! `name:tag`, `name@digest` — disambiguated by delimiter position. No
//! teacher or pack analogue to ground this on (the teacher's `main.rs` only
//! declares `mod repo;`; `repo.rs` itself isn't present anywhere under
//! `examples/`), so this is original code against the three-shape grammar
//! the data model's glossary spells out.

/// A parsed reference: the repository name (no tag/digest) and the
/// canonical full-reference string used as the storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub full: String,
}

/// Parses a raw reference string, normalising a bare name to `:latest`.
pub fn parse(raw: &str) -> Reference {
    if let Some(at) = raw.rfind('@') {
        return Reference {
            name: raw[..at].to_owned(),
            full: raw.to_owned(),
        };
    }

    let slash = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
    match raw[slash..].rfind(':') {
        Some(colon) => {
            let idx = slash + colon;
            Reference {
                name: raw[..idx].to_owned(),
                full: raw.to_owned(),
            }
        }
        None => Reference {
            name: raw.to_owned(),
            full: format!("{raw}:latest"),
        },
    }
}
