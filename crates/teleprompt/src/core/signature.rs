use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{CompileError, CompileResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub role: FieldRole,
    #[serde(default)]
    pub description: String,
    /// Only output fields carry a prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// An optional output may be absent from a response.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

/// Static description of a predictor's ordered input and output fields.
///
/// Build one with [`Signature::builder`]:
///
/// ```
/// use teleprompt::Signature;
///
/// let sig = Signature::builder("QA")
///     .instruction("Answer the question.")
///     .input("question", "A trivia question")
///     .output("answer", "A short answer")
///     .build()
///     .unwrap();
/// assert_eq!(sig.first_output().name, "answer");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    name: String,
    instruction: String,
    fields: Vec<Field>,
}

/// Structural identity of a signature: its name and field names by role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureShape {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl Signature {
    pub fn builder(name: impl Into<String>) -> SignatureBuilder {
        SignatureBuilder {
            name: name.into(),
            instruction: String::new(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The default instruction. Falls back to a generic one built from the
    /// field names when none was given.
    pub fn instruction(&self) -> String {
        if !self.instruction.is_empty() {
            return self.instruction.clone();
        }
        let names = |role| {
            self.fields
                .iter()
                .filter(|f| f.role == role)
                .map(|f| format!("`{}`", f.name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "Given the fields {}, produce the fields {}.",
            names(FieldRole::Input),
            names(FieldRole::Output)
        )
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn input_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.role == FieldRole::Input)
    }

    pub fn output_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.role == FieldRole::Output)
    }

    /// The output field whose prefix instruction search optimizes.
    pub fn first_output(&self) -> &Field {
        // `build` guarantees at least one output field.
        self.output_fields()
            .next()
            .unwrap_or_else(|| &self.fields[self.fields.len() - 1])
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.field(name).is_some_and(|f| f.role == FieldRole::Output)
    }

    pub fn shape(&self) -> SignatureShape {
        SignatureShape {
            name: self.name.clone(),
            inputs: self.input_fields().map(|f| f.name.clone()).collect(),
            outputs: self.output_fields().map(|f| f.name.clone()).collect(),
        }
    }
}

pub struct SignatureBuilder {
    name: String,
    instruction: String,
    fields: Vec<Field>,
}

impl SignatureBuilder {
    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn input(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            role: FieldRole::Input,
            description: description.into(),
            prefix: None,
            optional: false,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            role: FieldRole::Output,
            description: description.into(),
            prefix: None,
            optional: false,
        });
        self
    }

    pub fn output_with_prefix(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        self.fields.push(Field {
            name: name.into(),
            role: FieldRole::Output,
            description: description.into(),
            prefix: Some(prefix.into()),
            optional: false,
        });
        self
    }

    /// An output field the model may leave out.
    pub fn optional_output_with_prefix(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        self.fields.push(Field {
            name: name.into(),
            role: FieldRole::Output,
            description: description.into(),
            prefix: Some(prefix.into()),
            optional: true,
        });
        self
    }

    pub fn build(self) -> CompileResult<Signature> {
        let invalid = |reason: &str| CompileError::InvalidSignature {
            signature: self.name.clone(),
            reason: reason.to_string(),
        };

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(invalid("field names must not be empty"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(&format!("duplicate field `{}`", field.name)));
            }
        }
        if !self.fields.iter().any(|f| f.role == FieldRole::Input) {
            return Err(invalid("at least one input field is required"));
        }
        if !self.fields.iter().any(|f| f.role == FieldRole::Output) {
            return Err(invalid("at least one output field is required"));
        }

        let fields = self
            .fields
            .into_iter()
            .map(|mut f| {
                if f.role == FieldRole::Output && f.prefix.is_none() {
                    f.prefix = Some(infer_prefix(&f.name));
                }
                f
            })
            .collect();

        Ok(Signature {
            name: self.name,
            instruction: self.instruction,
            fields,
        })
    }
}

/// `reasoning_steps` -> `Reasoning Steps:`
pub fn infer_prefix(name: &str) -> String {
    let words: Vec<String> = name
        .split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    format!("{}:", words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_prefix() {
        assert_eq!(infer_prefix("answer"), "Answer:");
        assert_eq!(infer_prefix("reasoning_steps"), "Reasoning Steps:");
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let err = Signature::builder("Dup")
            .input("question", "")
            .output("question", "")
            .build()
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidSignature { .. }));
    }

    #[test]
    fn test_requires_both_roles() {
        assert!(Signature::builder("NoOut").input("q", "").build().is_err());
        assert!(Signature::builder("NoIn").output("a", "").build().is_err());
    }

    #[test]
    fn test_order_and_prefixes() {
        let sig = Signature::builder("CoT")
            .input("question", "")
            .output_with_prefix("reasoning", "", "Let's think step by step:")
            .output("answer", "")
            .build()
            .unwrap();

        assert_eq!(sig.first_output().name, "reasoning");
        assert_eq!(
            sig.first_output().prefix.as_deref(),
            Some("Let's think step by step:")
        );
        assert_eq!(sig.field("answer").unwrap().prefix.as_deref(), Some("Answer:"));
        assert_eq!(
            sig.shape(),
            SignatureShape {
                name: "CoT".to_string(),
                inputs: vec!["question".to_string()],
                outputs: vec!["reasoning".to_string(), "answer".to_string()],
            }
        );
    }

    #[test]
    fn test_optional_output() {
        let sig = Signature::builder("Propose")
            .input("seed", "")
            .output("instruction", "")
            .optional_output_with_prefix("prefix", "", "Prefix:")
            .build()
            .unwrap();

        assert!(!sig.field("instruction").unwrap().optional);
        assert!(sig.field("prefix").unwrap().optional);
        assert_eq!(sig.shape().outputs, vec!["instruction", "prefix"]);
    }

    #[test]
    fn test_default_instruction() {
        let sig = Signature::builder("QA")
            .input("question", "")
            .output("answer", "")
            .build()
            .unwrap();
        assert_eq!(
            sig.instruction(),
            "Given the fields `question`, produce the fields `answer`."
        );
    }
}
