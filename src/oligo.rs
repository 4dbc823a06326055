//! Build-method expressions for cloning oligos.
//!
//! An expression is a `+`-joined list of string literals, candidate fields
//! (`target.sequence_wo_pam`, `target["sequence"]`) and `reverse_complement(...)`
//! calls. Expressions are parsed into [`OligoExpr`] and evaluated against one
//! candidate; nothing else is reachable from an expression.

use crate::{
    error::{DesignError, Result},
    model::{Candidate, Locus, RecognitionSystem},
    sequence_utils::reverse_complement,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{iter::Peekable, str::CharIndices};

const TARGET_BINDING: &str = "target";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateField {
    Sequence,
    SequenceWoPam,
}

impl CandidateField {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sequence" => Some(Self::Sequence),
            "sequence_wo_pam" => Some(Self::SequenceWoPam),
            _ => None,
        }
    }

    fn value<'a>(&self, candidate: &'a Candidate) -> &'a str {
        match self {
            Self::Sequence => &candidate.sequence,
            Self::SequenceWoPam => &candidate.sequence_wo_pam,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OligoFunction {
    ReverseComplement,
}

impl OligoFunction {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "reverse_complement" => Some(Self::ReverseComplement),
            _ => None,
        }
    }

    fn apply(&self, arg: &str) -> String {
        match self {
            Self::ReverseComplement => reverse_complement(arg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OligoExpr {
    Literal(String),
    Field(CandidateField),
    Call(OligoFunction, Box<OligoExpr>),
    Concat(Vec<OligoExpr>),
}

impl OligoExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let mut parser = Parser {
            expression,
            chars: expression.char_indices().peekable(),
        };
        let expr = parser.concat()?;
        parser.skip_whitespace();
        match parser.chars.peek().copied() {
            None => Ok(expr),
            Some((at, c)) => Err(parser.error(format!("unexpected '{c}' at {at}"))),
        }
    }

    pub fn evaluate(&self, candidate: &Candidate) -> String {
        match self {
            Self::Literal(text) => text.clone(),
            Self::Field(field) => field.value(candidate).to_string(),
            Self::Call(function, arg) => function.apply(&arg.evaluate(candidate)),
            Self::Concat(parts) => parts.iter().map(|p| p.evaluate(candidate)).collect(),
        }
    }
}

struct Parser<'a> {
    expression: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl Parser<'_> {
    fn error(&self, message: impl Into<String>) -> DesignError {
        DesignError::OligoExpression {
            expression: self.expression.to_string(),
            message: message.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    }

    fn consume(&mut self, wanted: char) -> Result<()> {
        self.skip_whitespace();
        match self.chars.next() {
            Some((_, c)) if c == wanted => Ok(()),
            Some((at, c)) => Err(self.error(format!("expected '{wanted}' at {at}, found '{c}'"))),
            None => Err(self.error(format!("expected '{wanted}' at end of expression"))),
        }
    }

    fn concat(&mut self) -> Result<OligoExpr> {
        let mut parts = vec![self.term()?];
        loop {
            self.skip_whitespace();
            if self.chars.next_if(|&(_, c)| c == '+').is_none() {
                break;
            }
            parts.push(self.term()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            OligoExpr::Concat(parts)
        })
    }

    fn term(&mut self) -> Result<OligoExpr> {
        self.skip_whitespace();
        match self.chars.peek().copied() {
            Some((_, '"' | '\'')) => Ok(OligoExpr::Literal(self.string()?)),
            Some((_, '(')) => {
                self.chars.next();
                let inner = self.concat()?;
                self.consume(')')?;
                Ok(inner)
            }
            Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {
                let name = self.identifier();
                if name == TARGET_BINDING {
                    self.field()
                } else {
                    let function = OligoFunction::from_name(&name)
                        .ok_or_else(|| self.error(format!("unknown function '{name}'")))?;
                    self.consume('(')?;
                    let arg = self.concat()?;
                    self.consume(')')?;
                    Ok(OligoExpr::Call(function, Box::new(arg)))
                }
            }
            Some((at, c)) => Err(self.error(format!("unexpected '{c}' at {at}"))),
            None => Err(self.error("expression ends where a value was expected")),
        }
    }

    fn field(&mut self) -> Result<OligoExpr> {
        self.skip_whitespace();
        let name = match self.chars.next() {
            Some((_, '.')) => {
                self.skip_whitespace();
                self.identifier()
            }
            Some((_, '[')) => {
                self.skip_whitespace();
                let name = self.string()?;
                self.consume(']')?;
                name
            }
            _ => return Err(self.error("expected a field after 'target'")),
        };
        CandidateField::from_name(&name)
            .map(OligoExpr::Field)
            .ok_or_else(|| self.error(format!("unknown field '{name}'")))
    }

    fn identifier(&mut self) -> String {
        let mut name = String::new();
        while let Some((_, c)) = self
            .chars
            .next_if(|&(_, c)| c.is_ascii_alphanumeric() || c == '_')
        {
            name.push(c);
        }
        name
    }

    fn string(&mut self) -> Result<String> {
        let quote = match self.chars.next() {
            Some((_, q @ ('"' | '\''))) => q,
            _ => return Err(self.error("expected a string literal")),
        };
        let mut text = String::new();
        for (_, c) in self.chars.by_ref() {
            if c == quote {
                return Ok(text);
            }
            text.push(c);
        }
        Err(self.error("unterminated string literal"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOligo {
    pub primer_name: String,
    pub primer_sequence: String,
}

/// One oligo per rule of `method_name`; an unknown method yields no oligos.
pub fn build_oligos(
    locus: &Locus,
    system: &RecognitionSystem,
    candidate: &Candidate,
    method_name: &str,
) -> Result<Vec<BuildOligo>> {
    let Some(method) = system.build_method(method_name) else {
        debug!("{} has no build method '{method_name}'", system.name);
        return Ok(vec![]);
    };
    method
        .rules
        .iter()
        .map(|rule| {
            let expr = OligoExpr::parse(&rule.expression)?;
            Ok(BuildOligo {
                primer_name: format!("{}{}", locus.display_name(), rule.suffix),
                primer_sequence: expr.evaluate(candidate),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FoldResult, Strand};

    fn candidate() -> Candidate {
        Candidate {
            locus_id: 1,
            system_id: 1,
            strand: Strand::Forward,
            position: 12,
            sequence: "GATTACAGATTACAGATTACTGG".to_string(),
            sequence_wo_pam: "GATTACAGATTACAGATTAC".to_string(),
            gc_content: 0.3,
            fold: FoldResult {
                notation: String::new(),
                notation_binding_only: String::new(),
                accessibility: 1.0,
            },
            composite_score: 1.0,
        }
    }

    fn locus() -> Locus {
        Locus {
            id: 1,
            orf: "YOR202W".to_string(),
            symbol: Some("HIS3".to_string()),
            strain: "CEN.PK113-7D".to_string(),
            sequence: "A".repeat(40),
            start_orf: 10,
            end_orf: 30,
        }
    }

    fn eval(expression: &str) -> Result<String> {
        Ok(OligoExpr::parse(expression)?.evaluate(&candidate()))
    }

    #[test]
    fn test_literal_and_field_concatenation() {
        assert_eq!(
            eval("\"aaa\" + target.sequence_wo_pam + 'ccc'").unwrap(),
            "aaaGATTACAGATTACAGATTACccc"
        );
    }

    #[test]
    fn test_subscript_field_syntax() {
        assert_eq!(
            eval("target[\"sequence\"]").unwrap(),
            "GATTACAGATTACAGATTACTGG"
        );
        assert_eq!(eval("target [ 'sequence_wo_pam' ]").unwrap(), candidate().sequence_wo_pam);
    }

    #[test]
    fn test_double_reverse_complement_is_identity() {
        assert_eq!(
            eval("reverse_complement(reverse_complement(target.sequence_wo_pam))").unwrap(),
            "GATTACAGATTACAGATTAC"
        );
    }

    #[test]
    fn test_reverse_complement_of_concatenation() {
        assert_eq!(eval("reverse_complement('AAC' + \"G\")").unwrap(), "CGTT");
        assert_eq!(eval("('A' + 'C') + 'G'").unwrap(), "ACG");
    }

    #[test]
    fn test_rejects_anything_outside_the_language() {
        for bad in [
            "__import__('os')",
            "target.locus",
            "target.sequence * 2",
            "'unterminated",
            "reverse_complement 'A'",
            "",
            "'A' +",
            "target",
        ] {
            let err = eval(bad).unwrap_err();
            assert!(
                matches!(err, DesignError::OligoExpression { .. }),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_build_oligos_names_by_display_name() {
        let system = RecognitionSystem::cas9_ngg();
        let oligos = build_oligos(&locus(), &system, &candidate(), "pMEL").unwrap();
        assert_eq!(oligos.len(), 2);
        assert_eq!(oligos[0].primer_name, "HIS3 pMEL fw");
        assert_eq!(oligos[1].primer_name, "HIS3 pMEL rv");
        assert!(oligos[0].primer_sequence.contains("GATTACAGATTACAGATTAC"));
        assert_eq!(
            oligos[1].primer_sequence,
            reverse_complement(&oligos[0].primer_sequence)
        );
    }

    #[test]
    fn test_unknown_method_yields_no_oligos() {
        let system = RecognitionSystem::cas9_ngg();
        let oligos = build_oligos(&locus(), &system, &candidate(), "pUDP").unwrap();
        assert!(oligos.is_empty());
    }
}
