use anyhow::{Result, anyhow};
use indexmap::IndexMap;
use serde_json::Value;

use crate::data::value_text;
use crate::{Chat, Demonstration, Field, LmRequest, Message, Predictor, Signature};

const COMPLETED: &str = "completed";

/// Renders a predictor into a chat request and parses `[[ ## field ## ]]`
/// delimited responses back into output fields.
#[derive(Default, Clone, Copy, Debug)]
pub struct ChatAdapter;

fn marker(name: &str) -> String {
    format!("[[ ## {name} ## ]]")
}

fn parse_marker(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("[[ ## ")
        .and_then(|rest| rest.strip_suffix(" ## ]]"))
        .map(str::trim)
}

/// Renders output fields the way a well-behaved model answers.
pub fn render_fields(fields: &IndexMap<String, Value>) -> String {
    let mut out = String::new();
    for (name, value) in fields {
        out.push_str(&format!("{}\n{}\n\n", marker(name), value_text(value)));
    }
    out.push_str(&format!("{}\n", marker(COMPLETED)));
    out
}

impl ChatAdapter {
    fn field_attribute_list<'a>(&self, fields: impl Iterator<Item = &'a Field>) -> String {
        let mut list = String::new();
        for (i, field) in fields.enumerate() {
            list.push_str(&format!("{}. `{}` (String)", i + 1, field.name));
            if !field.description.is_empty() {
                list.push_str(&format!(": {}", field.description));
            }
            list.push('\n');
        }
        list
    }

    fn format_system_message(&self, predictor: &Predictor) -> String {
        let signature = predictor.signature();
        let inputs = self.field_attribute_list(signature.input_fields());
        let outputs = self.field_attribute_list(signature.output_fields());

        let mut structure = String::new();
        for field in signature.input_fields() {
            structure.push_str(&format!("{}\n{}\n\n", marker(&field.name), field.name));
        }
        for field in signature.output_fields() {
            let prefix = predictor.prefix(&field.name).unwrap_or_default();
            let placeholder = if prefix.is_empty() {
                field.name.clone()
            } else {
                format!("{prefix} {}", field.name)
            };
            structure.push_str(&format!("{}\n{placeholder}\n\n", marker(&field.name)));
        }

        format!(
            "Your input fields are:\n{inputs}\nYour output fields are:\n{outputs}\n\
             All interactions will be structured in the following way, with the appropriate values filled in.\n\n\
             {structure}{}\n\n\
             In adhering to this structure, your objective is:\n\t{}",
            marker(COMPLETED),
            predictor.instruction()
        )
    }

    fn format_user_message(&self, signature: &Signature, inputs: &IndexMap<String, Value>) -> String {
        let mut message = String::new();
        for field in signature.input_fields() {
            if let Some(value) = inputs.get(&field.name) {
                message.push_str(&format!("{}\n{}\n\n", marker(&field.name), value_text(value)));
            }
        }

        let mut outputs = signature.output_fields();
        if let Some(first) = outputs.next() {
            message.push_str(&format!(
                "Respond with the corresponding output fields, starting with the field `{}`,",
                first.name
            ));
        }
        for field in outputs {
            message.push_str(&format!(" then `{}`,", field.name));
        }
        message.push_str(" and then ending with the marker for `completed`.");
        message
    }

    fn format_assistant_message(&self, signature: &Signature, outputs: &IndexMap<String, Value>) -> String {
        let present: IndexMap<String, Value> = signature
            .output_fields()
            .filter_map(|f| outputs.get(&f.name).map(|v| (f.name.clone(), v.clone())))
            .collect();
        render_fields(&present)
    }

    fn format_demos(&self, signature: &Signature, demos: &[Demonstration]) -> Chat {
        let mut chat = Chat::default();
        for demo in demos {
            // A labeled demo attached to a downstream stage may not carry that
            // stage's inputs at all; such demos say nothing useful.
            if !signature.input_fields().any(|f| demo.inputs().contains_key(&f.name)) {
                continue;
            }
            chat.push(Message::user(self.format_user_message(signature, demo.inputs())));
            chat.push(Message::assistant(
                self.format_assistant_message(signature, demo.outputs()),
            ));
        }
        chat
    }

    /// Builds the model request for one predictor call.
    pub fn format(&self, predictor: &Predictor, inputs: &IndexMap<String, Value>) -> LmRequest {
        let signature = predictor.signature();

        let mut chat = Chat::default();
        chat.push(Message::system(self.format_system_message(predictor)));
        chat.push_all(self.format_demos(signature, predictor.demos()));
        chat.push(Message::user(self.format_user_message(signature, inputs)));

        LmRequest {
            signature: signature.name().to_string(),
            instruction: predictor.instruction().to_string(),
            inputs: inputs.clone(),
            chat,
            config: predictor.config().clone(),
        }
    }

    /// Splits a response into its marked sections and returns the
    /// signature's output fields, prefixes stripped. Optional fields the
    /// response leaves out are absent from the result.
    pub fn parse(&self, predictor: &Predictor, content: &str) -> Result<IndexMap<String, Value>> {
        let mut sections: IndexMap<String, String> = IndexMap::new();
        let mut current: Option<String> = None;

        for line in content.lines() {
            if let Some(name) = parse_marker(line) {
                current = (name != COMPLETED).then(|| name.to_string());
                if let Some(name) = &current {
                    sections.entry(name.clone()).or_default();
                }
                continue;
            }
            if let Some(name) = &current
                && let Some(section) = sections.get_mut(name)
            {
                if !section.is_empty() {
                    section.push('\n');
                }
                section.push_str(line);
            }
        }

        let signature = predictor.signature();
        let mut outputs = IndexMap::new();
        for field in signature.output_fields() {
            if field.optional && !sections.contains_key(&field.name) {
                continue;
            }
            let raw = sections.get(&field.name).ok_or_else(|| {
                anyhow!(
                    "response for `{}` is missing output field `{}`",
                    signature.name(),
                    field.name
                )
            })?;
            let mut value = raw.trim();
            if let Some(prefix) = predictor.prefix(&field.name).filter(|p| !p.is_empty()) {
                value = value.strip_prefix(prefix).map(str::trim).unwrap_or(value);
            }
            outputs.insert(field.name.clone(), Value::String(value.to_string()));
        }
        Ok(outputs)
    }
}
