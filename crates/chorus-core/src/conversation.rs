use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, MessageId};

/// A non-human participant. Immutable once placed in a [`Roster`]; the
/// ordinal index is only used to stagger response delays.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    /// Short handle matched by `@tag` mentions.
    pub tag: String,
    pub ordinal_index: usize,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    /// Deliberate responders wait a little longer before speaking.
    #[serde(default)]
    pub deliberate: bool,
}

impl Agent {
    pub fn new(name: impl Into<String>, tag: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            tag: tag.into(),
            ordinal_index: 0,
            model: model.into(),
            persona: None,
            deliberate: false,
        }
    }

    pub fn with_id(mut self, id: AgentId) -> Self {
        self.id = id;
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    pub fn deliberate(mut self) -> Self {
        self.deliberate = true;
        self
    }
}

/// Ordered set of active agents. Ordinal indices always mirror position.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Roster {
    agents: Vec<Agent>,
}

impl Roster {
    pub fn new(agents: impl IntoIterator<Item = Agent>) -> Self {
        let mut roster = Self::default();
        for agent in agents {
            roster.push(agent);
        }
        roster
    }

    /// Append an agent. Returns false if an agent with the same id is present.
    pub fn push(&mut self, mut agent: Agent) -> bool {
        if self.get(&agent.id).is_some() {
            return false;
        }
        agent.ordinal_index = self.agents.len();
        self.agents.push(agent);
        true
    }

    pub fn remove(&mut self, id: &AgentId) -> Option<Agent> {
        let idx = self.position(id)?;
        let removed = self.agents.remove(idx);
        for (i, agent) in self.agents.iter_mut().enumerate() {
            agent.ordinal_index = i;
        }
        Some(removed)
    }

    pub fn position(&self, id: &AgentId) -> Option<usize> {
        self.agents.iter().position(|a| &a.id == id)
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.iter().find(|a| &a.id == id)
    }

    /// Case-insensitive lookup by mention tag.
    pub fn by_tag(&self, tag: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.tag.eq_ignore_ascii_case(tag))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.agents.iter()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "agent_id", rename_all = "snake_case")]
pub enum Author {
    Human,
    Agent(AgentId),
    /// Synthetic notices such as joins and leaves.
    System,
}

/// One entry of the append-only conversation feed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author: Author,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(author: Author, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            author,
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn human(text: impl Into<String>) -> Self {
        Self::new(Author::Human, text)
    }

    pub fn from_agent(agent_id: AgentId, text: impl Into<String>) -> Self {
        Self::new(Author::Agent(agent_id), text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Author::System, text)
    }

    pub fn is_from(&self, agent_id: &AgentId) -> bool {
        matches!(&self.author, Author::Agent(id) if id == agent_id)
    }

    pub fn is_human(&self) -> bool {
        self.author == Author::Human
    }

    pub fn is_system(&self) -> bool {
        self.author == Author::System
    }

    pub fn is_question(&self) -> bool {
        self.text.contains('?')
    }
}
