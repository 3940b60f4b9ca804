use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::mutate::{
    AddToPortalBar, InsertCategory, PageMutator, PrependTemplate, RenameCategoryTag,
    RenameTemplate, RewriteLinks, SubstituteFileName, TemplateSide,
};

/// Request family discriminator, stored as its snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    ReplaceTemplate,
    AddCategory,
    MoveCategory,
    AddTemplate,
    DistributePortal,
    ReplaceLink,
    ReplaceFile,
    DistributeTemplate,
}

impl RequestType {
    pub const ALL: [RequestType; 8] = [
        Self::ReplaceTemplate,
        Self::AddCategory,
        Self::MoveCategory,
        Self::AddTemplate,
        Self::DistributePortal,
        Self::ReplaceLink,
        Self::ReplaceFile,
        Self::DistributeTemplate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReplaceTemplate => "replace_template",
            Self::AddCategory => "add_category",
            Self::MoveCategory => "move_category",
            Self::AddTemplate => "add_template",
            Self::DistributePortal => "distribute_portal",
            Self::ReplaceLink => "replace_link",
            Self::ReplaceFile => "replace_file",
            Self::DistributeTemplate => "distribute_template",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which query enumerates the pages a request touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    /// Transcluders of the source template (optionally within a category), or of the destination.
    TemplateScope,
    /// Members of the source category, or of the destination.
    CategoryScope,
    /// Pages linking the source portal through the embedding template but not the destination.
    PortalScope,
    /// Pages linking the source title within a fixed namespace set.
    BacklinkScope,
    /// Pages embedding the source file.
    FileScope,
    /// Outbound links of the source page itself.
    SelfContained,
}

impl FanOut {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TemplateScope => "template",
            Self::CategoryScope => "category",
            Self::PortalScope => "portal",
            Self::BacklinkScope => "backlink",
            Self::FileScope => "file",
            Self::SelfContained => "self",
        }
    }
}

pub struct Strategy {
    pub fan_out: FanOut,
    pub mutator: Box<dyn PageMutator>,
}

/// Resolver/executor pairing per request type, built once at startup.
pub struct StrategyTable {
    entries: BTreeMap<RequestType, Strategy>,
}

impl StrategyTable {
    pub fn standard() -> Self {
        let mut table = Self {
            entries: BTreeMap::new(),
        };
        table.register(RequestType::ReplaceTemplate, FanOut::TemplateScope, RenameTemplate);
        table.register(RequestType::AddCategory, FanOut::TemplateScope, InsertCategory);
        table.register(RequestType::MoveCategory, FanOut::CategoryScope, RenameCategoryTag);
        table.register(
            RequestType::AddTemplate,
            FanOut::CategoryScope,
            PrependTemplate(TemplateSide::Source),
        );
        table.register(RequestType::DistributePortal, FanOut::PortalScope, AddToPortalBar);
        table.register(RequestType::ReplaceLink, FanOut::BacklinkScope, RewriteLinks);
        table.register(RequestType::ReplaceFile, FanOut::FileScope, SubstituteFileName);
        table.register(
            RequestType::DistributeTemplate,
            FanOut::SelfContained,
            PrependTemplate(TemplateSide::Destination),
        );
        table
    }

    pub fn register(
        &mut self,
        request_type: RequestType,
        fan_out: FanOut,
        mutator: impl PageMutator + 'static,
    ) {
        self.entries.insert(
            request_type,
            Strategy {
                fan_out,
                mutator: Box::new(mutator),
            },
        );
    }

    pub fn get(&self, request_type: RequestType) -> Result<&Strategy> {
        self.entries
            .get(&request_type)
            .ok_or_else(|| anyhow::anyhow!("no strategy registered for {request_type}"))
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::standard()
    }
}
