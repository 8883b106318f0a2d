//! Processor dropping objects whose identifying attribute is blacklisted.
//!
//! ```xml
//! <Processor class="BlackListFilter" id="deny" attribute="uid" quarantine="q/deny">
//!   <entry value="1.2.3.4"/>
//!   <entry regex="^9\.9\..*"/>
//!   <entry>5.6.7</entry>
//! </Processor>
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_common::{
    Acceptance, FileObject, PipelineStage, Processor, Quarantine, StageState, StageStats,
    StageStatus,
};
use regex::Regex;
use tracing::{info, warn};

use super::StageEnv;
use crate::config::StageConfig;
use crate::{Error, Result};

/// One blacklist entry.
#[derive(Debug, Clone)]
pub enum Rule {
    Equals(String),
    Matches(Regex),
}

impl Rule {
    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Rule::Equals(expected) => expected == value,
            Rule::Matches(regex) => regex.is_match(value),
        }
    }
}

pub struct BlackListFilter {
    id: String,
    name: String,
    attribute: String,
    rules: Vec<Rule>,
    acceptance: Acceptance,
    quarantine: Option<Arc<Quarantine>>,
    stats: Arc<StageStats>,
}

impl BlackListFilter {
    pub const CLASS: &'static str = "BlackListFilter";

    pub async fn from_config(config: &StageConfig, _env: &StageEnv) -> Result<Self> {
        let mut rules = Vec::new();
        for entry in config.children_named("entry") {
            if let Some(pattern) = entry.attr("regex") {
                let regex = Regex::new(pattern).map_err(|e| {
                    Error::config(format!("{}: invalid blacklist regex '{}': {}", config.id(), pattern, e))
                })?;
                rules.push(Rule::Matches(regex));
            } else if let Some(value) = entry.attr("value") {
                rules.push(Rule::Equals(value.to_string()));
            } else if !entry.text.trim().is_empty() {
                rules.push(Rule::Equals(entry.text.trim().to_string()));
            }
        }

        let mut filter = Self::new(
            config.id(),
            config.name(),
            config.attr("attribute").unwrap_or("uid"),
            rules,
        );
        filter.acceptance = config.acceptance();
        if let Some(dir) = config.quarantine() {
            filter.quarantine = Some(Arc::new(Quarantine::open(dir).await?));
        }
        Ok(filter)
    }

    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        attribute: impl Into<String>,
        rules: Vec<Rule>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attribute: attribute.into(),
            rules,
            acceptance: Acceptance::default(),
            quarantine: None,
            stats: StageStats::new(),
        }
    }

    pub fn with_quarantine(mut self, quarantine: Arc<Quarantine>) -> Self {
        self.quarantine = Some(quarantine);
        self
    }

    /// The value the rules are matched against.
    fn value_of<'a>(&self, object: &'a FileObject) -> Option<&'a str> {
        match self.attribute.as_str() {
            "uid" | "SOPInstanceUID" => object.uid(),
            "studyUID" | "StudyInstanceUID" => object.study_uid(),
            "filename" => Some(object.file_name()),
            other => object.attribute(other),
        }
    }

    pub fn is_blacklisted(&self, object: &FileObject) -> bool {
        self.value_of(object)
            .is_some_and(|value| self.rules.iter().any(|rule| rule.is_match(value)))
    }
}

#[async_trait]
impl PipelineStage for BlackListFilter {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn acceptance(&self) -> Acceptance {
        self.acceptance
    }

    fn quarantine(&self) -> Option<&Quarantine> {
        self.quarantine.as_deref()
    }

    async fn start(&self) -> pipeline_common::Result<()> {
        if self.stats.try_start() {
            info!("Started {} with {} entries", self.name, self.rules.len());
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.stats.set_state(StageState::Stopped);
    }

    fn is_down(&self) -> bool {
        self.stats.state() != StageState::Running
    }

    fn status(&self) -> StageStatus {
        self.stats
            .snapshot(&self.id, &self.name, Self::CLASS)
            .with_quarantine(self.quarantine.as_deref())
            .with_detail("attribute", &self.attribute)
            .with_detail("entries", self.rules.len())
    }
}

#[async_trait]
impl Processor for BlackListFilter {
    async fn process(&self, object: FileObject) -> Option<FileObject> {
        let started = std::time::Instant::now();
        self.stats.record_in(object.file_name());
        if !self.is_blacklisted(&object) {
            self.stats.record_out(started.elapsed());
            return Some(object);
        }

        self.stats.record_failure();
        info!(stage = %self.name, object = %object.file_name(), "Blacklisted object rejected");
        if let Some(quarantine) = &self.quarantine
            && let Err(e) = quarantine.insert_copy(object.path()).await
        {
            warn!(stage = %self.name, error = %e, "Unable to quarantine blacklisted object");
        }
        None
    }
}
