//! Tool name codec: public tool identifiers ⇄ `(server, tool)` pairs.
//!
//! Public names look like `mcp__syntropy__serena_find_symbol`: a constant
//! prefix, the server segment, one `_`, then the tool segment. The server
//! segment never contains `_`; the tool segment may contain anything
//! (including further `_`). Comparison is case sensitive throughout.
//!
//! Children do not always use underscores natively. Per-server
//! normalization rules translate the public tool segment into the child's
//! own tool name. Rules are looked up in an explicit table; servers without
//! an entry keep their names unchanged.

use super::errors::ParseError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Literal prefix every public tool identifier starts with.
pub const TOOL_PREFIX: &str = "mcp__syntropy__";

/// Separator between the server and tool segments.
pub const SEGMENT_DELIMITER: char = '_';

/// Server segment reserved for the aggregator's own tools.
pub const BUILTIN_SERVER: &str = "syntropy";

/// A known-good identifier quoted in error messages.
pub const EXAMPLE_TOOL_NAME: &str = "mcp__syntropy__serena_find_symbol";

// ─── ToolIdentifier ──────────────────────────────────────────────────────────

/// Parsed form of a public tool name. Both segments are non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolIdentifier {
    pub server: String,
    pub tool: String,
}

impl ToolIdentifier {
    pub fn new(server: &str, tool: &str) -> Self {
        Self {
            server: server.to_string(),
            tool: tool.to_string(),
        }
    }
}

impl std::fmt::Display for ToolIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&encode(self))
    }
}

/// Split `mcp__syntropy__<server>_<tool>` into its segments.
pub fn parse(name: &str) -> Result<ToolIdentifier, ParseError> {
    let rest = name
        .strip_prefix(TOOL_PREFIX)
        .ok_or_else(|| ParseError::malformed(name))?;

    let (server, tool) = rest
        .split_once(SEGMENT_DELIMITER)
        .ok_or_else(|| ParseError::malformed(name))?;

    if server.is_empty() || tool.is_empty() {
        return Err(ParseError::malformed(name));
    }

    Ok(ToolIdentifier::new(server, tool))
}

/// Inverse of [`parse`].
pub fn encode(id: &ToolIdentifier) -> String {
    format!("{TOOL_PREFIX}{}{SEGMENT_DELIMITER}{}", id.server, id.tool)
}

/// A valid public name for `server`, used to show callers the shape of a
/// correct call.
pub fn example_name_for(server: &str) -> String {
    if server == "serena" || server.is_empty() {
        EXAMPLE_TOOL_NAME.to_string()
    } else {
        encode(&ToolIdentifier::new(server, "list_tools"))
    }
}

// ─── Normalization ───────────────────────────────────────────────────────────

/// How a server spells its native tool names relative to the public form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingRule {
    /// Native names equal the public tool segment.
    Identity,
    /// Native names use `-` where the public segment uses `_`.
    Hyphenate,
}

impl NamingRule {
    /// Public tool segment → native tool name.
    pub fn to_native(self, tool: &str) -> String {
        match self {
            NamingRule::Identity => tool.to_string(),
            NamingRule::Hyphenate => tool.replace('_', "-"),
        }
    }

    /// Native tool name → public tool segment.
    pub fn to_public(self, native: &str) -> String {
        match self {
            NamingRule::Identity => native.to_string(),
            NamingRule::Hyphenate => native.replace('-', "_"),
        }
    }
}

/// Servers whose native naming differs from the public form. Everything
/// else is [`NamingRule::Identity`]; new exceptions are added here.
const NAMING_RULES: &[(&str, NamingRule)] = &[("context7", NamingRule::Hyphenate)];

/// Naming rule for a server segment.
pub fn naming_rule(server: &str) -> NamingRule {
    NAMING_RULES
        .iter()
        .find(|(name, _)| *name == server)
        .map(|(_, rule)| *rule)
        .unwrap_or(NamingRule::Identity)
}

/// Public tool segment → the child's native tool name. Never fails.
pub fn normalize_for_server(server: &str, tool: &str) -> String {
    naming_rule(server).to_native(tool)
}

/// Native tool name reported by a child → the public identifier advertised
/// to the client.
pub fn public_tool_name(server: &str, native: &str) -> String {
    encode(&ToolIdentifier::new(server, &naming_rule(server).to_public(native)))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
