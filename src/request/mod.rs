//! Request parser (component C, §3.2, §4.C).
//!
//! ```text
//! select   := chunk ("+" chunk)*
//! chunk    := [N ":"] res "=" val (":" res "=" val)*     ; N defaults to 1
//! place    := field ("|" field)*
//! field    := "pack" | "scatter" | "vscatter" | "free"
//!           | "excl" | "exclhost" | "shared" | "group=" RESNAME
//! ```
//!
//! §4.C's prose gives the intra-chunk separator as `+`, but every concrete
//! example in spec.md §8 (S1: `select=1:ncpus=2:mem=2gb`) uses `:` between
//! resources within one chunk and reserves `+` for joining chunks — the
//! convention `qsub -l select=N:res=val:res=val+N:res=val` the rest of
//! this spec's source material (`original_source/`) also uses. We follow
//! the worked examples, which are normative, over the grammar snippet's
//! apparent shorthand.

use crate::resource::{parse_value, ResourceDef, ResourceValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub multiplicity: u32,
    /// Request list, in source order (signature building sorts it;
    /// unparsing keeps source order, per P10).
    pub requests: Vec<(String, String)>,
}

impl Chunk {
    /// A chunk referencing `host` or `vnode` pins placement without
    /// consuming (§3.2).
    pub fn pins_placement(&self) -> bool {
        self.requests.iter().any(|(k, _)| k == "host" || k == "vnode")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectSpec {
    pub chunks: Vec<Chunk>,
}

impl SelectSpec {
    pub fn total_chunks(&self) -> u32 {
        self.chunks.iter().map(|c| c.multiplicity).sum()
    }

    pub fn is_multinode_shape(&self) -> bool {
        self.total_chunks() > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arrangement {
    #[default]
    Free,
    Pack,
    Scatter,
    VScatter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sharing {
    #[default]
    Share,
    Excl,
    ExclHost,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Grouping {
    #[default]
    None,
    ByResource(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceSpec {
    pub arrangement: Arrangement,
    pub sharing: Sharing,
    pub grouping: Grouping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ParseError {}

/// Parse a `select` string into a normalized [`SelectSpec`].
pub fn parse_select(text: &str) -> Result<SelectSpec, ParseError> {
    let chunks = text
        .split('+')
        .map(parse_chunk)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SelectSpec { chunks })
}

fn parse_chunk(text: &str) -> Result<Chunk, ParseError> {
    let terms: Vec<&str> = text.split(':').collect();
    if terms.is_empty() {
        return Err(ParseError(format!("empty chunk: {text}")));
    }
    let (multiplicity, rest) = match terms[0].parse::<u32>() {
        Ok(n) => (n, &terms[1..]),
        Err(_) => (1, &terms[..]),
    };
    if rest.is_empty() {
        return Err(ParseError(format!("chunk has no requests: {text}")));
    }
    let mut requests = Vec::with_capacity(rest.len());
    for term in rest {
        let (res, val) = term
            .split_once('=')
            .ok_or_else(|| ParseError(format!("malformed resource request: {term}")))?;
        requests.push((res.trim().to_string(), val.trim().to_string()));
    }
    Ok(Chunk { multiplicity, requests })
}

/// Unparse a [`SelectSpec`] back into its textual form (P10: round-trips
/// with [`parse_select`]).
pub fn unparse_select(spec: &SelectSpec) -> String {
    spec.chunks
        .iter()
        .map(|c| {
            let reqs = c
                .requests
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(":");
            if c.multiplicity == 1 {
                reqs
            } else {
                format!("{}:{}", c.multiplicity, reqs)
            }
        })
        .collect::<Vec<_>>()
        .join("+")
}

/// Parse a `place` directive.
pub fn parse_place(text: &str) -> Result<PlaceSpec, ParseError> {
    let mut spec = PlaceSpec::default();
    if text.trim().is_empty() {
        return Ok(spec);
    }
    for field in text.split('|') {
        let field = field.trim();
        match field {
            "pack" => spec.arrangement = Arrangement::Pack,
            "scatter" => spec.arrangement = Arrangement::Scatter,
            "vscatter" => spec.arrangement = Arrangement::VScatter,
            "free" => spec.arrangement = Arrangement::Free,
            "excl" => spec.sharing = Sharing::Excl,
            "exclhost" => spec.sharing = Sharing::ExclHost,
            "shared" => spec.sharing = Sharing::Share,
            _ if field.starts_with("group=") => {
                spec.grouping = Grouping::ByResource(field["group=".len()..].to_string());
            }
            other => return Err(ParseError(format!("unknown place field: {other}"))),
        }
    }
    Ok(spec)
}

pub fn unparse_place(spec: &PlaceSpec) -> String {
    let mut fields = Vec::new();
    fields.push(
        match spec.arrangement {
            Arrangement::Free => "free",
            Arrangement::Pack => "pack",
            Arrangement::Scatter => "scatter",
            Arrangement::VScatter => "vscatter",
        }
        .to_string(),
    );
    match spec.sharing {
        Sharing::Share => fields.push("shared".to_string()),
        Sharing::Excl => fields.push("excl".to_string()),
        Sharing::ExclHost => fields.push("exclhost".to_string()),
    }
    if let Grouping::ByResource(name) = &spec.grouping {
        fields.push(format!("group={name}"));
    }
    fields.join("|")
}

/// Resolve a chunk's textual requests against the resource definition
/// table into typed values. Names policy does not know about are
/// dropped here but not treated as errors — the fit evaluator's "reduced
/// request" step (§4.H.2) is the place that cares which names are known.
pub fn resolve_chunk_requests(
    chunk: &Chunk,
    defs: &HashMap<String, Arc<ResourceDef>>,
) -> HashMap<String, ResourceValue> {
    let mut out = HashMap::new();
    for (name, text) in &chunk.requests {
        if let Some(def) = defs.get(name) {
            if let Some(v) = parse_value(def, text) {
                out.insert(name.clone(), v);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_one_chunk_select() {
        let spec = parse_select("1:ncpus=2:mem=2gb").unwrap();
        assert_eq!(spec.chunks.len(), 1);
        assert_eq!(spec.chunks[0].multiplicity, 1);
        assert_eq!(spec.chunks[0].requests.len(), 2);
        assert_eq!(spec.total_chunks(), 1);
    }

    #[test]
    fn default_multiplicity_is_one() {
        let spec = parse_select("ncpus=1").unwrap();
        assert_eq!(spec.chunks[0].multiplicity, 1);
    }

    #[test]
    fn scatter_with_multiple_chunks_is_multinode() {
        let spec = parse_select("4:ncpus=1").unwrap();
        assert!(spec.is_multinode_shape());
    }

    #[test]
    fn multiple_chunks_joined_by_plus() {
        let spec = parse_select("2:ncpus=4:mem=8gb+1:ncpus=2").unwrap();
        assert_eq!(spec.chunks.len(), 2);
        assert_eq!(spec.total_chunks(), 3);
    }

    #[test]
    fn select_round_trips_through_unparse() {
        let original = "2:ncpus=4:mem=8gb";
        let spec = parse_select(original).unwrap();
        assert_eq!(unparse_select(&spec), original);
    }

    #[test]
    fn place_round_trips_through_unparse() {
        let original = "scatter|excl|group=host";
        let spec = parse_place(original).unwrap();
        assert_eq!(unparse_place(&spec), original);
    }

    #[test]
    fn place_defaults_to_free_and_shared() {
        let spec = parse_place("").unwrap();
        assert_eq!(spec.arrangement, Arrangement::Free);
        assert_eq!(spec.sharing, Sharing::Share);
    }
}
