mod nmap;

use crate::models::NewFinding;

pub use nmap::{parse_nmap_xml, NmapParseError};

pub const NMAP_TOOL: &str = "nmap";

pub fn parse(raw_output: &str, tool_name: &str) -> Vec<NewFinding> {
    match tool_name {
        NMAP_TOOL => nmap::findings_from_xml(raw_output),
        _ => Vec::new(),
    }
}
