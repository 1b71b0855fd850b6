use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use anyhow::{Result, bail};
use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparatorStyle {
    /// `<start_of_turn>{role}\n{content}<end_of_turn>\n` per message.
    GemmaTurns,
    /// Message contents joined by `sep`, no role markup.
    Plain,
}

#[derive(Debug, Clone)]
pub struct ConversationTemplate {
    pub name: String,
    pub system_message: String,
    pub roles: (String, String),
    pub messages: Vec<(String, Option<String>)>,
    pub sep_style: SeparatorStyle,
    pub turn_start: String,
    pub sep: String,
}

impl ConversationTemplate {
    pub fn set_system_message<S: Into<String>>(&mut self, system_message: S) {
        self.system_message = system_message.into();
    }

    pub fn append_message<S>(&mut self, role: S, message: Option<String>)
    where
        S: Into<String>,
    {
        self.messages.push((role.into(), message));
    }

    pub fn reset_messages(&mut self) {
        self.messages.clear();
    }

    /// Appends a user turn followed by an open model turn.
    pub fn push_user_turn(&mut self, content: impl Into<String>) {
        let (user, model) = self.roles.clone();
        self.append_message(user, Some(content.into()));
        self.append_message(model, None);
    }

    pub fn get_prompt(&self) -> String {
        match self.sep_style {
            SeparatorStyle::GemmaTurns => self.render_gemma(),
            SeparatorStyle::Plain => self.render_plain(),
        }
    }

    fn render_gemma(&self) -> String {
        let mut buffer = String::new();
        let mut system = Some(self.system_message.trim()).filter(|s| !s.is_empty());
        for (role, message) in &self.messages {
            buffer.push_str(&self.turn_start);
            buffer.push_str(role);
            buffer.push('\n');
            let Some(content) = message else {
                continue;
            };
            // Gemma has no system role; the system text prefixes the first user turn.
            if *role == self.roles.0 {
                if let Some(system) = system.take() {
                    buffer.push_str(system);
                    buffer.push_str("\n\n");
                }
            }
            buffer.push_str(content);
            buffer.push_str(&self.sep);
        }
        buffer
    }

    fn render_plain(&self) -> String {
        let mut buffer = String::new();
        let system = self.system_message.trim();
        if !system.is_empty() {
            buffer.push_str(system);
            buffer.push_str(&self.sep);
        }
        for (_, message) in &self.messages {
            if let Some(content) = message.as_ref().map(|m| m.trim()).filter(|m| !m.is_empty()) {
                buffer.push_str(content);
                buffer.push_str(&self.sep);
            }
        }
        buffer
    }
}

impl Default for ConversationTemplate {
    fn default() -> Self {
        gemma3_template()
    }
}

static CONVERSATION_TEMPLATES: Lazy<RwLock<BTreeMap<String, ConversationTemplate>>> =
    Lazy::new(|| {
        let mut map = BTreeMap::new();
        map.insert("gemma3".into(), gemma3_template());
        map.insert("plain".into(), plain_template());
        RwLock::new(map)
    });

pub fn register_conv_template(
    template: ConversationTemplate,
    override_existing: bool,
) -> Result<()> {
    let mut guard = CONVERSATION_TEMPLATES
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    if !override_existing && guard.contains_key(&template.name) {
        bail!("conversation template `{}` is already registered", template.name);
    }
    guard.insert(template.name.clone(), template);
    Ok(())
}

pub fn get_conv_template(name: &str) -> Option<ConversationTemplate> {
    CONVERSATION_TEMPLATES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
}

pub fn registered_template_names() -> Vec<String> {
    CONVERSATION_TEMPLATES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect()
}

fn gemma3_template() -> ConversationTemplate {
    ConversationTemplate {
        name: "gemma3".into(),
        system_message: String::new(),
        roles: ("user".into(), "model".into()),
        messages: Vec::new(),
        sep_style: SeparatorStyle::GemmaTurns,
        turn_start: "<start_of_turn>".into(),
        sep: "<end_of_turn>\n".into(),
    }
}

fn plain_template() -> ConversationTemplate {
    ConversationTemplate {
        name: "plain".into(),
        system_message: String::new(),
        roles: (String::new(), String::new()),
        messages: Vec::new(),
        sep_style: SeparatorStyle::Plain,
        turn_start: String::new(),
        sep: "\n".into(),
    }
}
