//! XML configuration.
//!
//! ```xml
//! <Configuration>
//!   <Server port="8080" ssl="no" certificate="cert.pem" privateKey="key.pem"/>
//!   <Users>
//!     <User username="admin" password="secret" roles="admin,import"/>
//!   </Users>
//!   <Pipeline name="Main">
//!     <ImportService class="PollingImportService" id="pull" root="roots/pull" url="peer:7777"/>
//!     <StorageService class="FileStorageService" id="store" root="storage" port="9090"/>
//!     <ExportService class="DatabaseExportService" id="db" root="roots/db"
//!                    adapterClass="sqlite" fileStorageServiceID="store" poolSize="4"/>
//!   </Pipeline>
//! </Configuration>
//! ```
//!
//! The element name of a stage selects its role, the `class` attribute its
//! implementation. Every other attribute and child element is kept verbatim
//! on [`StageConfig`] for the stage constructor to interpret.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use pipeline_common::{Acceptance, ExportConfig, PoolConfig};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};

use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Default port of the admin server.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub users: Vec<UserConfig>,
    pub pipelines: Vec<PipelineConfig>,
}

/// The `<Server>` element: the admin HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub ssl: bool,
    pub require_authentication: bool,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    /// Host name advertised in URLs handed to other systems.
    pub address: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
            ssl: false,
            require_authentication: false,
            certificate: None,
            private_key: None,
            address: None,
        }
    }
}

/// A `<User>` allowed to call authenticated endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageRole {
    Import,
    Processor,
    Storage,
    Export,
}

impl StageRole {
    fn from_element(name: &str) -> Option<Self> {
        match name {
            "ImportService" => Some(StageRole::Import),
            "Processor" => Some(StageRole::Processor),
            "StorageService" => Some(StageRole::Storage),
            "ExportService" => Some(StageRole::Export),
            _ => None,
        }
    }
}

/// A child element of a stage, e.g. a blacklist `<entry>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildElement {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
}

impl ChildElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Configuration record of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub role: StageRole,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<ChildElement>,
    /// Fallback id for stages without an `id` attribute.
    default_id: String,
}

impl StageConfig {
    pub fn new(role: StageRole, default_id: impl Into<String>) -> Self {
        Self {
            role,
            attributes: BTreeMap::new(),
            children: Vec::new(),
            default_id: default_id.into(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: ChildElement) -> Self {
        self.children.push(child);
        self
    }

    /// Trimmed, non-empty attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn class(&self) -> &str {
        self.attr("class").unwrap_or_default()
    }

    pub fn id(&self) -> &str {
        self.attr("id").unwrap_or(&self.default_id)
    }

    pub fn name(&self) -> &str {
        self.attr("name").unwrap_or_else(|| self.class())
    }

    /// `yes`/`true` or `no`/`false`; anything else yields `default`.
    pub fn flag(&self, name: &str, default: bool) -> bool {
        match self.attr(name).map(str::to_ascii_lowercase).as_deref() {
            Some("yes") | Some("true") => true,
            Some("no") | Some("false") => false,
            _ => default,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(|v| v.parse().ok())
    }

    fn non_negative(&self, name: &str) -> Option<u64> {
        self.int(name).map(|v| v.max(0) as u64)
    }

    /// Working directory of the stage (`root`, or `rootDirectory`).
    pub fn root(&self) -> Result<PathBuf> {
        self.attr("root")
            .or_else(|| self.attr("rootDirectory"))
            .map(PathBuf::from)
            .ok_or_else(|| Error::config(format!("{}: missing root directory attribute", self.name())))
    }

    pub fn quarantine(&self) -> Option<PathBuf> {
        self.attr("quarantine").map(PathBuf::from)
    }

    /// Poll interval, falling back to 5 s when missing or outside [1 s, 10 s].
    pub fn interval(&self) -> Duration {
        ExportConfig::clamp_interval(self.non_negative("interval"))
    }

    /// Per-object throttle, capped at 5 s.
    pub fn throttle(&self) -> Duration {
        ExportConfig::clamp_throttle(self.non_negative("throttle"))
    }

    /// Worker count, clamped to [1, 10].
    pub fn pool_size(&self) -> usize {
        PoolConfig::clamp_pool_size(self.non_negative("poolSize").map(|v| v as usize))
    }

    /// Embedded server port; `None` when absent or zero.
    pub fn port(&self) -> Option<u16> {
        self.int("port")
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
    }

    /// Storage retention in days; zero disables the monitor.
    pub fn time_depth(&self) -> u32 {
        self.int("timeDepth")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    }

    pub fn acceptance(&self) -> Acceptance {
        Acceptance {
            dicom: self.flag("acceptDicomObjects", true),
            xml: self.flag("acceptXmlObjects", true),
            zip: self.flag("acceptZipObjects", true),
            file: self.flag("acceptFileObjects", true),
        }
    }

    /// Export tunables assembled from `enableExport`, `interval` and `throttle`.
    pub fn export_config(&self) -> ExportConfig {
        ExportConfig::default()
            .with_enabled(self.flag("enableExport", true))
            .with_interval(self.interval())
            .with_throttle(self.throttle())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ChildElement> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

impl AppConfig {
    /// Load the configuration from an XML file.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error("reading configuration", path, e))?;
        Self::from_xml(&text)
    }

    pub fn from_xml(text: &str) -> Result<Self> {
        let config = Parser::default().parse(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for pipeline in &self.pipelines {
            for stage in &pipeline.stages {
                if !ids.insert(stage.id()) {
                    return Err(Error::config(format!("duplicate stage id '{}'", stage.id())));
                }
            }
        }
        if self.server.ssl && (self.server.certificate.is_none() || self.server.private_key.is_none()) {
            return Err(Error::config(
                "ssl requires both the certificate and privateKey attributes",
            ));
        }
        Ok(())
    }

    pub fn stage(&self, id: &str) -> Option<&StageConfig> {
        self.pipelines
            .iter()
            .flat_map(|p| p.stages.iter())
            .find(|s| s.id() == id)
    }
}

fn element_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

fn attributes(e: &BytesStart<'_>) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(Error::xml)?;
        let key = element_name(attr.key.as_ref());
        let value = attr.unescape_value()?.into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

fn yes(attrs: &BTreeMap<String, String>, name: &str) -> bool {
    attrs
        .get(name)
        .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "yes" | "true"))
}

fn non_empty(attrs: &BTreeMap<String, String>, name: &str) -> Option<String> {
    attrs
        .get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Event-driven parser state.
#[derive(Default)]
struct Parser {
    config: AppConfig,
    stack: Vec<String>,
    pipeline: Option<PipelineConfig>,
    stage: Option<StageConfig>,
    child: Option<ChildElement>,
}

impl Parser {
    fn parse(mut self, text: &str) -> Result<AppConfig> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    self.open(&e)?;
                    self.stack.push(element_name(e.name().as_ref()));
                }
                Event::Empty(e) => {
                    self.open(&e)?;
                    self.stack.push(element_name(e.name().as_ref()));
                    self.close();
                }
                Event::End(_) => self.close(),
                Event::Text(t) => {
                    if let Some(child) = self.child.as_mut() {
                        child.text.push_str(&t.unescape()?);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if self.stack.is_empty() && self.pipeline.is_none() {
            Ok(self.config)
        } else {
            Err(Error::xml("unexpected end of configuration"))
        }
    }

    fn open(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let name = element_name(e.name().as_ref());
        match (self.stack.len(), self.stack.last().map(String::as_str)) {
            (1, _) => match name.as_str() {
                "Server" => self.server(&attributes(e)?),
                "Pipeline" => {
                    let attrs = attributes(e)?;
                    let index = self.config.pipelines.len() + 1;
                    self.pipeline = Some(PipelineConfig {
                        name: non_empty(&attrs, "name")
                            .unwrap_or_else(|| format!("Pipeline {index}")),
                        stages: Vec::new(),
                    });
                }
                _ => {}
            },
            (2, Some("Users")) if name == "User" => {
                let attrs = attributes(e)?;
                if let Some(username) = non_empty(&attrs, "username") {
                    self.config.users.push(UserConfig {
                        username,
                        password: attrs.get("password").cloned().unwrap_or_default(),
                        roles: attrs
                            .get("roles")
                            .map(|r| {
                                r.split(',')
                                    .map(|s| s.trim().to_string())
                                    .filter(|s| !s.is_empty())
                                    .collect()
                            })
                            .unwrap_or_default(),
                    });
                }
            }
            (2, Some("Pipeline")) => {
                let Some(role) = StageRole::from_element(&name) else {
                    return Err(Error::config(format!("unknown pipeline element <{name}>")));
                };
                let pipeline_index = self.config.pipelines.len();
                let stage_index = self.pipeline.as_ref().map_or(0, |p| p.stages.len());
                let mut stage =
                    StageConfig::new(role, format!("stage-{pipeline_index}-{stage_index}"));
                stage.attributes = attributes(e)?;
                self.stage = Some(stage);
            }
            (3, _) if self.stage.is_some() => {
                self.child = Some(ChildElement {
                    name,
                    attributes: attributes(e)?,
                    text: String::new(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self) {
        let depth = self.stack.len();
        self.stack.pop();
        match depth {
            4 => {
                if let (Some(child), Some(stage)) = (self.child.take(), self.stage.as_mut()) {
                    stage.children.push(child);
                }
            }
            3 => {
                if let (Some(stage), Some(pipeline)) = (self.stage.take(), self.pipeline.as_mut()) {
                    pipeline.stages.push(stage);
                }
            }
            2 => {
                if let Some(pipeline) = self.pipeline.take() {
                    self.config.pipelines.push(pipeline);
                }
            }
            _ => {}
        }
    }

    fn server(&mut self, attrs: &BTreeMap<String, String>) {
        let server = &mut self.config.server;
        if let Some(port) = attrs.get("port").and_then(|p| p.trim().parse().ok()) {
            server.port = port;
        }
        server.ssl = yes(attrs, "ssl");
        server.require_authentication = yes(attrs, "requireAuthentication");
        server.certificate = non_empty(attrs, "certificate").map(PathBuf::from);
        server.private_key = non_empty(attrs, "privateKey").map(PathBuf::from);
        server.address = non_empty(attrs, "address");
    }
}
