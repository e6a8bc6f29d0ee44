use crate::error::EngineError;
use oxigraph::io::RdfFormat;
use oxigraph::model::{GraphNameRef, Literal, NamedNode, Quad, Subject, Term, Triple};
use oxigraph::sparql::QueryResults;
use oxigraph::store::Store;
use std::collections::HashMap;

/// Abstract triple store contract (C1). The engine and every service operate
/// exclusively through this trait.
///
/// No transaction support is required: the execution core serializes writes
/// per instance lane, so readers and writers only overlap across *different*
/// instance subgraphs.
pub trait GraphStore: Send + Sync {
    fn add(&self, s: &NamedNode, p: &NamedNode, o: &Term) -> Result<(), EngineError>;

    /// Remove matching triples; `o = None` removes all objects of (s, p).
    /// Returns the number of triples removed.
    fn remove(&self, s: &NamedNode, p: &NamedNode, o: Option<&Term>)
        -> Result<usize, EngineError>;

    /// Remove every triple with the given subject.
    fn remove_subject(&self, s: &NamedNode) -> Result<usize, EngineError>;

    /// Replace all objects of (s, p) with a single one.
    fn set(&self, s: &NamedNode, p: &NamedNode, o: &Term) -> Result<(), EngineError> {
        self.remove(s, p, None)?;
        self.add(s, p, o)
    }

    /// First object of (s, p), if any.
    fn value(&self, s: &NamedNode, p: &NamedNode) -> Result<Option<Term>, EngineError>;

    fn triples(
        &self,
        s: Option<&NamedNode>,
        p: Option<&NamedNode>,
        o: Option<&Term>,
    ) -> Result<Vec<Triple>, EngineError>;

    /// SPARQL SELECT with `?var` bindings substituted into the query text.
    fn query(
        &self,
        select: &str,
        bindings: &[(&str, Term)],
    ) -> Result<Vec<HashMap<String, Term>>, EngineError>;

    /// SPARQL ASK with `?var` bindings substituted into the query text.
    fn ask(&self, query: &str, bindings: &[(&str, Term)]) -> Result<bool, EngineError>;

    fn serialize(&self, format: RdfFormat) -> Result<Vec<u8>, EngineError>;

    fn parse(&self, bytes: &[u8], format: RdfFormat) -> Result<(), EngineError>;

    // ── Typed convenience readers ──

    fn value_node(&self, s: &NamedNode, p: &NamedNode) -> Result<Option<NamedNode>, EngineError> {
        Ok(match self.value(s, p)? {
            Some(Term::NamedNode(n)) => Some(n),
            _ => None,
        })
    }

    fn value_literal(&self, s: &NamedNode, p: &NamedNode) -> Result<Option<Literal>, EngineError> {
        Ok(match self.value(s, p)? {
            Some(Term::Literal(l)) => Some(l),
            _ => None,
        })
    }

    /// Lexical form of a literal object, or the IRI string of a node object.
    fn value_str(&self, s: &NamedNode, p: &NamedNode) -> Result<Option<String>, EngineError> {
        Ok(self.value(s, p)?.map(|t| match t {
            Term::Literal(l) => l.value().to_string(),
            Term::NamedNode(n) => n.as_str().to_string(),
            other => other.to_string(),
        }))
    }

    /// All subjects s such that (s, p, o) holds.
    fn subjects_with(&self, p: &NamedNode, o: &Term) -> Result<Vec<NamedNode>, EngineError> {
        Ok(self
            .triples(None, Some(p), Some(o))?
            .into_iter()
            .filter_map(|t| match t.subject {
                Subject::NamedNode(n) => Some(n),
                _ => None,
            })
            .collect())
    }

    /// All objects of (s, p).
    fn objects(&self, s: &NamedNode, p: &NamedNode) -> Result<Vec<Term>, EngineError> {
        Ok(self
            .triples(Some(s), Some(p), None)?
            .into_iter()
            .map(|t| t.object)
            .collect())
    }
}

/// Substitute `?name` occurrences with SPARQL-serialized terms. Whole-word
/// matches only, so `?instance` does not bite into `?instanceOf`.
fn bind_query(query: &str, bindings: &[(&str, Term)]) -> String {
    let mut text = query.to_string();
    for (name, term) in bindings {
        let needle = format!("?{name}");
        let replacement = term.to_string();
        let mut out = String::with_capacity(text.len());
        let mut rest = text.as_str();
        while let Some(idx) = rest.find(&needle) {
            let after = rest[idx + needle.len()..].chars().next();
            let word_continues =
                matches!(after, Some(c) if c.is_ascii_alphanumeric() || c == '_');
            out.push_str(&rest[..idx]);
            if word_continues {
                out.push_str(&needle);
            } else {
                out.push_str(&replacement);
            }
            rest = &rest[idx + needle.len()..];
        }
        out.push_str(rest);
        text = out;
    }
    text
}

/// The production `GraphStore`: an oxigraph store using the default graph.
pub struct OxiGraphStore {
    inner: Store,
}

impl OxiGraphStore {
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            inner: Store::new().map_err(EngineError::store)?,
        })
    }

    fn quad(s: &NamedNode, p: &NamedNode, o: &Term) -> Quad {
        Quad::new(s.clone(), p.clone(), o.clone(), GraphNameRef::DefaultGraph)
    }
}

impl GraphStore for OxiGraphStore {
    fn add(&self, s: &NamedNode, p: &NamedNode, o: &Term) -> Result<(), EngineError> {
        self.inner
            .insert(&Self::quad(s, p, o))
            .map_err(EngineError::store)?;
        Ok(())
    }

    fn remove(
        &self,
        s: &NamedNode,
        p: &NamedNode,
        o: Option<&Term>,
    ) -> Result<usize, EngineError> {
        let matches: Vec<Quad> = self
            .inner
            .quads_for_pattern(
                Some(s.as_ref().into()),
                Some(p.as_ref()),
                o.map(|t| t.as_ref()),
                Some(GraphNameRef::DefaultGraph),
            )
            .collect::<Result<_, _>>()
            .map_err(EngineError::store)?;
        for quad in &matches {
            self.inner.remove(quad).map_err(EngineError::store)?;
        }
        Ok(matches.len())
    }

    fn remove_subject(&self, s: &NamedNode) -> Result<usize, EngineError> {
        let matches: Vec<Quad> = self
            .inner
            .quads_for_pattern(
                Some(s.as_ref().into()),
                None,
                None,
                Some(GraphNameRef::DefaultGraph),
            )
            .collect::<Result<_, _>>()
            .map_err(EngineError::store)?;
        for quad in &matches {
            self.inner.remove(quad).map_err(EngineError::store)?;
        }
        Ok(matches.len())
    }

    fn value(&self, s: &NamedNode, p: &NamedNode) -> Result<Option<Term>, EngineError> {
        let mut iter = self.inner.quads_for_pattern(
            Some(s.as_ref().into()),
            Some(p.as_ref()),
            None,
            Some(GraphNameRef::DefaultGraph),
        );
        match iter.next() {
            Some(Ok(quad)) => Ok(Some(quad.object)),
            Some(Err(e)) => Err(EngineError::store(e)),
            None => Ok(None),
        }
    }

    fn triples(
        &self,
        s: Option<&NamedNode>,
        p: Option<&NamedNode>,
        o: Option<&Term>,
    ) -> Result<Vec<Triple>, EngineError> {
        self.inner
            .quads_for_pattern(
                s.map(|n| n.as_ref().into()),
                p.map(|n| n.as_ref()),
                o.map(|t| t.as_ref()),
                Some(GraphNameRef::DefaultGraph),
            )
            .map(|r| {
                r.map(|q| Triple::new(q.subject, q.predicate, q.object))
                    .map_err(EngineError::store)
            })
            .collect()
    }

    fn query(
        &self,
        select: &str,
        bindings: &[(&str, Term)],
    ) -> Result<Vec<HashMap<String, Term>>, EngineError> {
        let text = bind_query(select, bindings);
        let results = self.inner.query(text.as_str()).map_err(EngineError::sparql)?;
        match results {
            QueryResults::Solutions(solutions) => {
                let mut rows = Vec::new();
                for solution in solutions {
                    let solution = solution.map_err(EngineError::sparql)?;
                    let row = solution
                        .iter()
                        .map(|(var, term)| (var.as_str().to_string(), term.clone()))
                        .collect();
                    rows.push(row);
                }
                Ok(rows)
            }
            _ => Err(EngineError::Sparql("expected a SELECT query".to_string())),
        }
    }

    fn ask(&self, query: &str, bindings: &[(&str, Term)]) -> Result<bool, EngineError> {
        let text = bind_query(query, bindings);
        match self.inner.query(text.as_str()).map_err(EngineError::sparql)? {
            QueryResults::Boolean(answer) => Ok(answer),
            _ => Err(EngineError::Sparql("expected an ASK query".to_string())),
        }
    }

    fn serialize(&self, format: RdfFormat) -> Result<Vec<u8>, EngineError> {
        self.inner
            .dump_graph_to_writer(GraphNameRef::DefaultGraph, format, Vec::new())
            .map_err(|e| EngineError::Serialization(e.to_string()))
    }

    fn parse(&self, bytes: &[u8], format: RdfFormat) -> Result<(), EngineError> {
        self.inner
            .load_from_reader(format, bytes)
            .map_err(|e| EngineError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::model::Literal;

    fn node(iri: &str) -> NamedNode {
        NamedNode::new_unchecked(iri)
    }

    fn store_with_triple() -> OxiGraphStore {
        let store = OxiGraphStore::new().unwrap();
        store
            .add(
                &node("http://ex.org/s"),
                &node("http://ex.org/p"),
                &Term::Literal(Literal::from(42)),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_add_value_set_remove() {
        let store = store_with_triple();
        let s = node("http://ex.org/s");
        let p = node("http://ex.org/p");

        assert_eq!(
            store.value(&s, &p).unwrap(),
            Some(Term::Literal(Literal::from(42)))
        );

        // set replaces every object of (s, p)
        store
            .add(&s, &p, &Term::Literal(Literal::from(43)))
            .unwrap();
        store.set(&s, &p, &Term::Literal(Literal::from(7))).unwrap();
        assert_eq!(store.triples(Some(&s), Some(&p), None).unwrap().len(), 1);
        assert_eq!(
            store.value(&s, &p).unwrap(),
            Some(Term::Literal(Literal::from(7)))
        );

        assert_eq!(store.remove(&s, &p, None).unwrap(), 1);
        assert_eq!(store.value(&s, &p).unwrap(), None);
    }

    #[test]
    fn test_remove_subject_clears_all() {
        let store = store_with_triple();
        let s = node("http://ex.org/s");
        store
            .add(
                &s,
                &node("http://ex.org/q"),
                &Term::NamedNode(node("http://ex.org/o")),
            )
            .unwrap();
        assert_eq!(store.remove_subject(&s).unwrap(), 2);
        assert!(store.triples(Some(&s), None, None).unwrap().is_empty());
    }

    #[test]
    fn test_select_query_with_binding() {
        let store = store_with_triple();
        let rows = store
            .query(
                "SELECT ?o WHERE { ?s <http://ex.org/p> ?o }",
                &[(
                    "s",
                    Term::NamedNode(node("http://ex.org/s")),
                )],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["o"], Term::Literal(Literal::from(42)));
    }

    #[test]
    fn test_ask_query() {
        let store = store_with_triple();
        assert!(store
            .ask("ASK { <http://ex.org/s> <http://ex.org/p> ?v }", &[])
            .unwrap());
        assert!(!store
            .ask("ASK { <http://ex.org/s> <http://ex.org/missing> ?v }", &[])
            .unwrap());
    }

    #[test]
    fn test_bind_query_whole_word_only() {
        let bound = bind_query(
            "SELECT ?x WHERE { ?instance ?p ?instanceOf }",
            &[(
                "instance",
                Term::NamedNode(node("http://ex.org/i1")),
            )],
        );
        assert!(bound.contains("<http://ex.org/i1> ?p ?instanceOf"));
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let store = store_with_triple();
        let bytes = store.serialize(RdfFormat::NTriples).unwrap();

        let copy = OxiGraphStore::new().unwrap();
        copy.parse(&bytes, RdfFormat::NTriples).unwrap();
        assert_eq!(
            copy.value(&node("http://ex.org/s"), &node("http://ex.org/p"))
                .unwrap(),
            Some(Term::Literal(Literal::from(42)))
        );
    }
}
