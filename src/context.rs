//! Presentation context negotiation and lookup.
//!
//! The [`ContextManager`] holds the contexts accepted for one association.
//! It is built once, at establishment time, by the association task,
//! and shared with service code as an immutable snapshot;
//! the negotiated abstract and transfer syntaxes of a context
//! never change for the lifetime of the association.

use std::collections::{BTreeMap, HashMap};

use snafu::{Backtrace, Snafu};

use crate::pdu::{
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
};

/// UID of the *Implicit VR Little Endian* transfer syntax,
/// the default transfer syntax of DICOM.
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// UID of the *Explicit VR Little Endian* transfer syntax.
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// UID of the *Verification* SOP class (C-ECHO).
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("no negotiated presentation context with id {}", id))]
    NoSuchContext { id: u8, backtrace: Backtrace },

    #[snafu(display(
        "no negotiated presentation context for abstract syntax {}",
        abstract_syntax
    ))]
    NoMatchingContext {
        abstract_syntax: String,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One accepted presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    /// the context identifier, an odd integer in 1..=255
    pub id: u8,
    /// the abstract syntax (SOP class UID) of the context
    pub abstract_syntax: String,
    /// the transfer syntax selected during negotiation
    pub transfer_syntax: String,
}

/// The immutable registry of accepted presentation contexts
/// of one association,
/// indexed both by context ID and by abstract syntax.
#[derive(Debug, Default, Clone)]
pub struct ContextManager {
    by_id: BTreeMap<u8, PresentationContext>,
    by_abstract_syntax: HashMap<String, u8>,
}

impl ContextManager {
    /// Build a manager from the contexts accepted during negotiation.
    ///
    /// When multiple accepted contexts share an abstract syntax,
    /// the one with the lowest ID wins the reverse index.
    pub fn new<I>(accepted: I) -> Self
    where
        I: IntoIterator<Item = PresentationContext>,
    {
        let mut by_id = BTreeMap::new();
        let mut by_abstract_syntax = HashMap::new();
        for context in accepted {
            by_abstract_syntax
                .entry(context.abstract_syntax.clone())
                .or_insert(context.id);
            by_id.insert(context.id, context);
        }
        ContextManager {
            by_id,
            by_abstract_syntax,
        }
    }

    /// Build a manager on the association requestor side,
    /// pairing the proposed contexts with the acceptor's results.
    pub fn from_negotiation(
        proposed: &[PresentationContextProposed],
        results: &[PresentationContextResult],
    ) -> Self {
        let accepted = results
            .iter()
            .filter(|result| result.reason == PresentationContextResultReason::Acceptance)
            .filter_map(|result| {
                proposed
                    .iter()
                    .find(|pc| pc.id == result.id)
                    .map(|pc| PresentationContext {
                        id: result.id,
                        abstract_syntax: pc.abstract_syntax.clone(),
                        transfer_syntax: result.transfer_syntax.clone(),
                    })
            })
            .collect::<Vec<_>>();
        Self::new(accepted)
    }

    /// Look up a context by its identifier.
    pub fn get(&self, id: u8) -> Result<&PresentationContext> {
        self.by_id.get(&id).ok_or_else(|| NoSuchContextSnafu { id }.build())
    }

    /// Find the context to use for a request
    /// on the given abstract syntax (SOP class UID).
    pub fn find_by_abstract_syntax(&self, abstract_syntax: &str) -> Result<&PresentationContext> {
        self.by_abstract_syntax
            .get(abstract_syntax)
            .and_then(|id| self.by_id.get(id))
            .ok_or_else(|| {
                NoMatchingContextSnafu {
                    abstract_syntax: abstract_syntax.to_string(),
                }
                .build()
            })
    }

    /// Whether no context was accepted at all.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The number of accepted contexts.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Iterate over the accepted contexts in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &PresentationContext> {
        self.by_id.values()
    }
}

/// Negotiate the presentation contexts of an incoming A-ASSOCIATE-RQ
/// against the supported abstract and transfer syntaxes.
///
/// Returns the per-context results to place in the A-ASSOCIATE-AC
/// together with the manager over the accepted subset.
///
/// For each proposed context, the first transfer syntax
/// in the requestor's proposal order which is locally supported wins;
/// an unsupported abstract syntax yields reason 3,
/// a context with no acceptable transfer syntax yields reason 4.
pub fn negotiate(
    proposed: &[PresentationContextProposed],
    supported_abstract_syntaxes: &[String],
    supported_transfer_syntaxes: &[String],
) -> (Vec<PresentationContextResult>, ContextManager) {
    let mut results = Vec::with_capacity(proposed.len());
    let mut accepted = Vec::new();

    for pc in proposed {
        if !supported_abstract_syntaxes
            .iter()
            .any(|uid| uid == &pc.abstract_syntax)
        {
            results.push(PresentationContextResult {
                id: pc.id,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            });
            continue;
        }

        match pc
            .transfer_syntaxes
            .iter()
            .find(|ts| supported_transfer_syntaxes.iter().any(|uid| &uid == ts))
        {
            Some(transfer_syntax) => {
                results.push(PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: transfer_syntax.clone(),
                });
                accepted.push(PresentationContext {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntax: transfer_syntax.clone(),
                });
            }
            None => {
                results.push(PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                });
            }
        }
    }

    (results, ContextManager::new(accepted))
}

/// Build the presentation contexts to propose in an A-ASSOCIATE-RQ:
/// one per abstract syntax, with odd IDs assigned sequentially from 1.
pub fn propose(
    abstract_syntaxes: &[String],
    transfer_syntaxes: &[String],
) -> Vec<PresentationContextProposed> {
    abstract_syntaxes
        .iter()
        .enumerate()
        .map(|(i, abstract_syntax)| PresentationContextProposed {
            id: (i * 2 + 1) as u8,
            abstract_syntax: abstract_syntax.clone(),
            transfer_syntaxes: transfer_syntaxes.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn proposal_assigns_odd_ids() {
        let contexts = propose(
            &strings(&[VERIFICATION_SOP_CLASS, "1.2.840.10008.5.1.4.1.1.7"]),
            &strings(&[IMPLICIT_VR_LE, EXPLICIT_VR_LE]),
        );
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].id, 1);
        assert_eq!(contexts[1].id, 3);
        assert_eq!(contexts[1].transfer_syntaxes.len(), 2);
    }

    #[test]
    fn negotiation_takes_first_proposed_match() {
        let proposed = vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
            transfer_syntaxes: strings(&[EXPLICIT_VR_LE, IMPLICIT_VR_LE]),
        }];
        let (results, manager) = negotiate(
            &proposed,
            &strings(&[VERIFICATION_SOP_CLASS]),
            &strings(&[IMPLICIT_VR_LE, EXPLICIT_VR_LE]),
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].reason, PresentationContextResultReason::Acceptance);
        // the requestor's order decides the tie-break
        assert_eq!(results[0].transfer_syntax, EXPLICIT_VR_LE);
        assert_eq!(manager.get(1).unwrap().transfer_syntax, EXPLICIT_VR_LE);
    }

    #[test]
    fn negotiation_reports_unsupported_abstract_syntax() {
        let proposed = vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.3.4".to_string(),
            transfer_syntaxes: strings(&[IMPLICIT_VR_LE]),
        }];
        let (results, manager) = negotiate(
            &proposed,
            &strings(&[VERIFICATION_SOP_CLASS]),
            &strings(&[IMPLICIT_VR_LE]),
        );
        assert_eq!(
            results[0].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert!(manager.is_empty());
    }

    #[test]
    fn negotiation_reports_unsupported_transfer_syntaxes() {
        let proposed = vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
            transfer_syntaxes: strings(&["1.2.840.10008.1.2.4.50"]),
        }];
        let (results, manager) = negotiate(
            &proposed,
            &strings(&[VERIFICATION_SOP_CLASS]),
            &strings(&[IMPLICIT_VR_LE, EXPLICIT_VR_LE]),
        );
        assert_eq!(
            results[0].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
        assert!(manager.is_empty());
    }

    #[test]
    fn reverse_index_finds_context_for_request() {
        let manager = ContextManager::new(vec![
            PresentationContext {
                id: 1,
                abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            },
            PresentationContext {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                transfer_syntax: EXPLICIT_VR_LE.to_string(),
            },
        ]);
        let context = manager
            .find_by_abstract_syntax("1.2.840.10008.5.1.4.1.1.7")
            .unwrap();
        assert_eq!(context.id, 3);
        assert!(manager.find_by_abstract_syntax("9.9.9").is_err());
    }

    #[test]
    fn requestor_side_manager_pairs_results_with_proposals() {
        let proposed = propose(
            &strings(&[VERIFICATION_SOP_CLASS, "1.2.840.10008.5.1.4.1.1.7"]),
            &strings(&[IMPLICIT_VR_LE]),
        );
        let results = vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            },
        ];
        let manager = ContextManager::from_negotiation(&proposed, &results);
        assert_eq!(manager.len(), 1);
        assert_eq!(
            manager.get(1).unwrap().abstract_syntax,
            VERIFICATION_SOP_CLASS
        );
    }
}
