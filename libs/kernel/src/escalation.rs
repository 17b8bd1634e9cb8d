//! Escalation procedures: failure class to handler function.

use crate::descriptor::FunctionIndex;
use crate::error::{ClassTable, Failure, FailureClass, LinkError};

/// One entry of an escalation procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationEntry {
    pub class: FailureClass,
    pub target: FunctionIndex,
}

/// Ordered (class, handler) pairs, most specific first.
#[derive(Debug, Clone, Default)]
pub struct EscalationProcedure {
    entries: Vec<EscalationEntry>,
}

impl EscalationProcedure {
    /// Builds a procedure, rejecting a default (`ANY`) entry anywhere but
    /// last.
    pub(crate) fn new(function: &str, entries: Vec<EscalationEntry>) -> Result<Self, LinkError> {
        let last = entries.len().saturating_sub(1);
        if entries
            .iter()
            .enumerate()
            .any(|(i, e)| e.class == FailureClass::ANY && i != last)
        {
            return Err(LinkError::DefaultEscalationNotLast(function.to_string()));
        }
        Ok(Self { entries })
    }

    /// First entry whose class the failure is-a; earlier entries win.
    pub fn find(&self, classes: &ClassTable, failure: &Failure) -> Option<FunctionIndex> {
        self.entries
            .iter()
            .find(|e| classes.is_a(failure.class(), e.class))
            .map(|e| e.target)
    }

    pub fn entries(&self) -> &[EscalationEntry] {
        &self.entries
    }

    pub fn has_default(&self) -> bool {
        self.entries
            .last()
            .is_some_and(|e| e.class == FailureClass::ANY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(class: FailureClass, target: usize) -> EscalationEntry {
        EscalationEntry {
            class,
            target: FunctionIndex(target),
        }
    }

    #[test]
    fn test_most_specific_listed_first_wins() {
        let mut classes = ClassTable::new();
        let type_b = classes.declare("type_b", FailureClass::APPLICATION).unwrap();
        let type_a = classes.declare("type_a", type_b).unwrap();

        let procedure = EscalationProcedure::new(
            "f",
            vec![
                entry(type_a, 1),
                entry(type_b, 2),
                entry(FailureClass::ANY, 3),
            ],
        )
        .unwrap();

        assert_eq!(
            procedure.find(&classes, &Failure::msg(type_a, "a")),
            Some(FunctionIndex(1))
        );
        assert_eq!(
            procedure.find(&classes, &Failure::msg(type_b, "b")),
            Some(FunctionIndex(2))
        );
        assert_eq!(
            procedure.find(&classes, &Failure::msg(FailureClass::USAGE, "u")),
            Some(FunctionIndex(3))
        );
        assert!(procedure.has_default());
    }

    #[test]
    fn test_descriptor_order_breaks_ties() {
        let mut classes = ClassTable::new();
        let type_b = classes.declare("type_b", FailureClass::APPLICATION).unwrap();
        let type_a = classes.declare("type_a", type_b).unwrap();

        // Supertype first: it shadows the subtype entry.
        let procedure =
            EscalationProcedure::new("f", vec![entry(type_b, 2), entry(type_a, 1)]).unwrap();
        assert_eq!(
            procedure.find(&classes, &Failure::msg(type_a, "a")),
            Some(FunctionIndex(2))
        );
    }

    #[test]
    fn test_no_match_without_default() {
        let classes = ClassTable::new();
        let procedure =
            EscalationProcedure::new("f", vec![entry(FailureClass::RESOLUTION, 1)]).unwrap();
        assert_eq!(
            procedure.find(&classes, &Failure::msg(FailureClass::APPLICATION, "x")),
            None
        );
    }

    #[test]
    fn test_default_must_be_last() {
        let err = EscalationProcedure::new(
            "f",
            vec![entry(FailureClass::ANY, 1), entry(FailureClass::USAGE, 2)],
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::DefaultEscalationNotLast(name) if name == "f"));
    }
}
