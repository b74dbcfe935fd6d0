//! Fragment-scoped sequential ID allocation.
//!
//! Every extracted element (fact, entity, quote, datum) gets an integer ID
//! unique within its kind and its fragment. IDs start at 1, grow by one and
//! are never reused. Cross-element references inside a fragment use these
//! integers until the payload builder turns them into string keys.
//!
//! One allocator exists per fragment run and is owned by that run's task,
//! so it takes `&mut self` and carries no locking.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ReferenceFormatError;

/// Kind of extracted element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Hecho,
    Entidad,
    Cita,
    Dato,
}

impl ElementKind {
    pub const ALL: [ElementKind; 4] = [
        ElementKind::Hecho,
        ElementKind::Entidad,
        ElementKind::Cita,
        ElementKind::Dato,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Hecho => "hecho",
            ElementKind::Entidad => "entidad",
            ElementKind::Cita => "cita",
            ElementKind::Dato => "dato",
        }
    }

    fn index(&self) -> usize {
        match self {
            ElementKind::Hecho => 0,
            ElementKind::Entidad => 1,
            ElementKind::Cita => 2,
            ElementKind::Dato => 3,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hecho" => Ok(ElementKind::Hecho),
            "entidad" => Ok(ElementKind::Entidad),
            "cita" => Ok(ElementKind::Cita),
            "dato" => Ok(ElementKind::Dato),
            other => Err(format!("unknown element kind '{}'", other)),
        }
    }
}

/// A reference to an element that is valid outside its fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalReference {
    pub fragment_id: String,
    pub kind: ElementKind,
    pub id: u32,
}

impl fmt::Display for GlobalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{}", self.fragment_id, self.kind, self.id)
    }
}

/// Outcome of comparing an LLM-echoed ID with what the allocator issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoCheck {
    /// The echoed ID matches the issued one
    Consistent,
    /// The LLM returned a different ID; the allocator's wins
    Mismatch { echoed: u32, issued: u32 },
    /// The LLM returned no ID
    Missing,
}

/// Allocation counts and labels for one fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub fragment_id: String,
    pub hechos: u32,
    pub entidades: u32,
    pub citas: u32,
    pub datos: u32,
    /// `kind#id` → label, in allocation order
    pub labels: IndexMap<String, String>,
}

impl AllocatorStats {
    pub fn total(&self) -> u32 {
        self.hechos + self.entidades + self.citas + self.datos
    }
}

/// Sequential ID allocator for one fragment.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    fragment_id: String,
    counters: [u32; 4],
    labels: IndexMap<String, String>,
}

impl IdAllocator {
    pub fn new(fragment_id: impl Into<String>) -> Self {
        Self {
            fragment_id: fragment_id.into(),
            counters: [0; 4],
            labels: IndexMap::new(),
        }
    }

    pub fn fragment_id(&self) -> &str {
        &self.fragment_id
    }

    /// Allocate the next ID of `kind`, remembering `label` for diagnostics.
    pub fn next_id(&mut self, kind: ElementKind, label: &str) -> u32 {
        let counter = &mut self.counters[kind.index()];
        *counter += 1;
        let id = *counter;
        self.labels
            .insert(format!("{}#{}", kind, id), label.to_string());
        id
    }

    pub fn next_hecho_id(&mut self, label: &str) -> u32 {
        self.next_id(ElementKind::Hecho, label)
    }

    pub fn next_entidad_id(&mut self, label: &str) -> u32 {
        self.next_id(ElementKind::Entidad, label)
    }

    pub fn next_cita_id(&mut self, label: &str) -> u32 {
        self.next_id(ElementKind::Cita, label)
    }

    pub fn next_dato_id(&mut self, label: &str) -> u32 {
        self.next_id(ElementKind::Dato, label)
    }

    /// Number of IDs issued so far for `kind`.
    pub fn issued(&self, kind: ElementKind) -> u32 {
        self.counters[kind.index()]
    }

    pub fn is_issued(&self, kind: ElementKind, id: u32) -> bool {
        id >= 1 && id <= self.issued(kind)
    }

    /// Compare an ID echoed back by the LLM against the one actually issued.
    ///
    /// Mismatches are logged; callers always keep `issued`.
    pub fn check_echoed_id(&self, kind: ElementKind, echoed: Option<u32>, issued: u32) -> EchoCheck {
        match echoed {
            None => EchoCheck::Missing,
            Some(e) if e == issued => EchoCheck::Consistent,
            Some(e) => {
                tracing::debug!(
                    fragment_id = %self.fragment_id,
                    kind = %kind,
                    echoed = e,
                    issued,
                    "LLM echoed a different id, keeping allocated id"
                );
                EchoCheck::Mismatch { echoed: e, issued }
            }
        }
    }

    pub fn get_stats(&self) -> AllocatorStats {
        AllocatorStats {
            fragment_id: self.fragment_id.clone(),
            hechos: self.issued(ElementKind::Hecho),
            entidades: self.issued(ElementKind::Entidad),
            citas: self.issued(ElementKind::Cita),
            datos: self.issued(ElementKind::Dato),
            labels: self.labels.clone(),
        }
    }

    /// Compose `fragment_id#kind#id`.
    pub fn global_reference(&self, kind: ElementKind, id: u32) -> String {
        GlobalReference {
            fragment_id: self.fragment_id.clone(),
            kind,
            id,
        }
        .to_string()
    }
}

/// Parse a `fragment_id#kind#id` reference.
///
/// The fragment id may itself contain `#`; kind and id are taken from the
/// right.
pub fn parse_global_reference(input: &str) -> Result<GlobalReference, ReferenceFormatError> {
    let fail = |reason: &str| ReferenceFormatError {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = input.rsplitn(3, '#');
    let (Some(id), Some(kind), Some(fragment_id)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(fail("expected fragment_id#kind#id"));
    };

    if fragment_id.is_empty() {
        return Err(fail("empty fragment id"));
    }
    let kind: ElementKind = kind.parse().map_err(|e: String| fail(&e))?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(fail("id is not a positive integer"));
    }
    let id: u32 = id.parse().map_err(|_| fail("id out of range"))?;
    if id == 0 {
        return Err(fail("ids start at 1"));
    }

    Ok(GlobalReference {
        fragment_id: fragment_id.to_string(),
        kind,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ids_start_at_one_per_kind() {
        let mut alloc = IdAllocator::new("art1_f0");
        assert_eq!(alloc.next_hecho_id("a"), 1);
        assert_eq!(alloc.next_hecho_id("b"), 2);
        assert_eq!(alloc.next_entidad_id("Ministerio"), 1);
        assert_eq!(alloc.next_cita_id("cita"), 1);
        assert_eq!(alloc.next_dato_id("PIB"), 1);
        assert_eq!(alloc.next_hecho_id("c"), 3);
    }

    #[test]
    fn stats_report_counts_and_labels_in_order() {
        let mut alloc = IdAllocator::new("frag");
        alloc.next_entidad_id("ONU");
        alloc.next_hecho_id("Cumbre");
        alloc.next_entidad_id("UE");

        let stats = alloc.get_stats();
        assert_eq!(stats.hechos, 1);
        assert_eq!(stats.entidades, 2);
        assert_eq!(stats.total(), 3);
        let keys: Vec<_> = stats.labels.keys().cloned().collect();
        assert_eq!(keys, vec!["entidad#1", "hecho#1", "entidad#2"]);
        assert_eq!(stats.labels["entidad#2"], "UE");
    }

    #[test]
    fn echoed_ids_are_checked_against_issued_ones() {
        let mut alloc = IdAllocator::new("frag");
        let id = alloc.next_hecho_id("x");
        assert_eq!(alloc.check_echoed_id(ElementKind::Hecho, Some(1), id), EchoCheck::Consistent);
        assert_eq!(
            alloc.check_echoed_id(ElementKind::Hecho, Some(7), id),
            EchoCheck::Mismatch { echoed: 7, issued: 1 }
        );
        assert_eq!(alloc.check_echoed_id(ElementKind::Hecho, None, id), EchoCheck::Missing);
        assert!(alloc.is_issued(ElementKind::Hecho, 1));
        assert!(!alloc.is_issued(ElementKind::Hecho, 2));
        assert!(!alloc.is_issued(ElementKind::Hecho, 0));
    }

    #[test]
    fn global_reference_keeps_hashes_in_fragment_id() {
        let alloc = IdAllocator::new("doc#7_f2");
        let reference = alloc.global_reference(ElementKind::Cita, 4);
        assert_eq!(reference, "doc#7_f2#cita#4");

        let parsed = parse_global_reference(&reference).unwrap();
        assert_eq!(parsed.fragment_id, "doc#7_f2");
        assert_eq!(parsed.kind, ElementKind::Cita);
        assert_eq!(parsed.id, 4);
    }

    #[test]
    fn malformed_references_are_rejected() {
        for input in ["", "frag", "frag#hecho", "#hecho#1", "frag#persona#1", "frag#hecho#x", "frag#hecho#0", "frag#hecho#-3"] {
            assert!(parse_global_reference(input).is_err(), "accepted {:?}", input);
        }
    }

    proptest! {
        #[test]
        fn ids_are_strictly_increasing_without_gaps(kinds in proptest::collection::vec(0usize..4, 0..200)) {
            let mut alloc = IdAllocator::new("p");
            let mut last = [0u32; 4];
            for k in kinds {
                let kind = ElementKind::ALL[k];
                let id = alloc.next_id(kind, "l");
                prop_assert_eq!(id, last[k] + 1);
                last[k] = id;
            }
            for kind in ElementKind::ALL {
                prop_assert_eq!(alloc.issued(kind), last[kind.index()]);
            }
        }

        #[test]
        fn global_reference_round_trips(fragment in "[a-z0-9_#-]{1,24}", k in 0usize..4, id in 1u32..100_000) {
            prop_assume!(!fragment.starts_with('#'));
            let alloc = IdAllocator::new(fragment.clone());
            let kind = ElementKind::ALL[k];
            let parsed = parse_global_reference(&alloc.global_reference(kind, id)).unwrap();
            prop_assert_eq!(parsed.fragment_id, fragment);
            prop_assert_eq!(parsed.kind, kind);
            prop_assert_eq!(parsed.id, id);
        }

        #[test]
        fn parsing_never_panics(input in ".{0,40}") {
            let _ = parse_global_reference(&input);
        }
    }
}
