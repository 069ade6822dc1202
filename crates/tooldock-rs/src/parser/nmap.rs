use quick_xml::de::from_str;
use serde::Deserialize;

use crate::models::{NewFinding, Severity};

const EXPOSURE_CATEGORY: &str = "Network Exposure";
const DEFAULT_REMEDIATION: &str = "Confirm this service has to be reachable from the scanned \
     network. If not, stop it or restrict access to the port with firewall rules.";
const VULNERS_SCRIPT: &str = "vulners";

#[derive(Debug, thiserror::Error)]
pub enum NmapParseError {
    #[error("output is not an XML document")]
    NotXml,
    #[error("invalid nmap XML: {0}")]
    Xml(#[from] quick_xml::de::DeError),
}

#[derive(Debug, Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, Deserialize)]
struct NmapHost {
    #[serde(rename = "address", default)]
    addresses: Vec<NmapAddress>,
    #[serde(default)]
    ports: Option<NmapPorts>,
}

#[derive(Debug, Deserialize)]
struct NmapAddress {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype", default)]
    addrtype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    ports: Vec<NmapPort>,
}

#[derive(Debug, Deserialize)]
struct NmapPort {
    #[serde(rename = "@portid")]
    portid: u16,
    #[serde(rename = "@protocol")]
    protocol: String,
    state: NmapState,
    #[serde(default)]
    service: Option<NmapService>,
    #[serde(rename = "script", default)]
    scripts: Vec<NmapScript>,
}

#[derive(Debug, Deserialize)]
struct NmapState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct NmapService {
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@product", default)]
    product: Option<String>,
    #[serde(rename = "@version", default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NmapScript {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "table", default)]
    tables: Vec<ScriptTable>,
}

#[derive(Debug, Deserialize)]
struct ScriptTable {
    #[serde(rename = "table", default)]
    tables: Vec<ScriptTable>,
    #[serde(rename = "elem", default)]
    elems: Vec<ScriptElem>,
}

#[derive(Debug, Deserialize)]
struct ScriptElem {
    #[serde(rename = "@key", default)]
    key: Option<String>,
    #[serde(rename = "$text", default)]
    value: String,
}

impl ScriptTable {
    fn elem(&self, key: &str) -> Option<&str> {
        self.elems
            .iter()
            .find(|e| e.key.as_deref() == Some(key))
            .map(|e| e.value.trim())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct VulnRecord {
    id: String,
    cvss: f64,
    references: Vec<String>,
}

impl VulnRecord {
    fn from_table(table: &ScriptTable) -> Option<Self> {
        let id = table.elem("id").filter(|id| !id.is_empty())?;
        let is_cve = id.to_ascii_uppercase().starts_with("CVE-")
            || table
                .elem("type")
                .is_some_and(|t| t.eq_ignore_ascii_case("cve"));
        if !is_cve {
            return None;
        }

        let cvss = table
            .elem("cvss")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|score| score.is_finite())
            .map(|score| score.clamp(0.0, 10.0))
            .unwrap_or(0.0);
        let references = table
            .elem("references")
            .map(|raw| raw.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        Some(Self {
            id: id.to_string(),
            cvss,
            references,
        })
    }
}

fn collect_vulns(tables: &[ScriptTable], out: &mut Vec<VulnRecord>) {
    for table in tables {
        if let Some(record) = VulnRecord::from_table(table) {
            out.push(record);
        }
        collect_vulns(&table.tables, out);
    }
}

impl NmapHost {
    fn primary_address(&self) -> &str {
        self.addresses
            .iter()
            .find(|a| matches!(a.addrtype.as_deref(), Some("ipv4" | "ipv6") | None))
            .or_else(|| self.addresses.first())
            .map(|a| a.addr.as_str())
            .unwrap_or("unknown")
    }
}

pub fn parse_nmap_xml(xml: &str) -> Result<Vec<NewFinding>, NmapParseError> {
    if !xml.trim_start().starts_with('<') {
        return Err(NmapParseError::NotXml);
    }
    let run: NmapRun = from_str(xml)?;

    let mut findings = Vec::new();
    for host in &run.hosts {
        let address = host.primary_address();
        let Some(ports) = &host.ports else {
            continue;
        };
        for port in ports.ports.iter().filter(|p| p.state.state == "open") {
            findings.push(port_finding(address, port));
        }
    }
    Ok(findings)
}

/// Unreadable output becomes one critical finding rather than an error.
pub(super) fn findings_from_xml(xml: &str) -> Vec<NewFinding> {
    parse_nmap_xml(xml).unwrap_or_else(|err| vec![parse_error_finding(&err)])
}

fn parse_error_finding(err: &NmapParseError) -> NewFinding {
    NewFinding {
        severity: Severity::Critical,
        title: "Output Parse Error".to_string(),
        description: format!(
            "The scanner output could not be parsed ({err}). Results of this scan are unknown."
        ),
        category: "Parser".to_string(),
        remediation: "Inspect the raw output of this job and run the scan again.".to_string(),
        ..NewFinding::default()
    }
}

fn port_finding(address: &str, port: &NmapPort) -> NewFinding {
    let service_name = port
        .service
        .as_ref()
        .and_then(|s| s.name.clone())
        .filter(|n| !n.is_empty());
    let version = port.service.as_ref().and_then(|s| {
        let parts: Vec<&str> = [s.product.as_deref(), s.version.as_deref()]
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    });

    let mut description = format!(
        "Port {}/{} is open on {}. Service: {}",
        port.portid,
        port.protocol,
        address,
        service_name.as_deref().unwrap_or("unknown"),
    );
    if let Some(version) = &version {
        description.push_str(&format!(" ({version})"));
    }
    description.push('.');

    let mut finding = NewFinding {
        severity: Severity::Info,
        title: format!("Open Port: {}/{}", port.portid, port.protocol),
        description,
        category: EXPOSURE_CATEGORY.to_string(),
        port: Some(port.portid),
        protocol: Some(port.protocol.clone()),
        service: service_name,
        version,
        remediation: DEFAULT_REMEDIATION.to_string(),
        affected_component: address.to_string(),
        ..NewFinding::default()
    };

    let mut vulns = Vec::new();
    for script in port.scripts.iter().filter(|s| s.id == VULNERS_SCRIPT) {
        collect_vulns(&script.tables, &mut vulns);
    }
    for vuln in &vulns {
        merge_vuln(&mut finding, vuln);
    }

    finding
}

fn merge_vuln(finding: &mut NewFinding, vuln: &VulnRecord) {
    if finding.cvss_score < vuln.cvss {
        finding.cvss_score = vuln.cvss;
    }
    if let Some(severity) = Severity::from_cvss(finding.cvss_score) {
        finding.severity = severity;
    }

    for reference in &vuln.references {
        if !finding.references.contains(reference) {
            finding.references.push(reference.clone());
        }
    }

    if finding.cve_ids.insert(vuln.id.clone()) {
        finding
            .description
            .push_str(&format!("\n{} (CVSS {:.1}) affects this service.", vuln.id, vuln.cvss));
        finding
            .remediation
            .push_str(&format!("\nApply the vendor update that fixes {}.", vuln.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(xml: &str) -> NewFinding {
        let mut findings = parse_nmap_xml(xml).expect("parse should work");
        assert_eq!(findings.len(), 1, "{findings:#?}");
        findings.remove(0)
    }

    #[test]
    fn open_ssh_port_without_scripts_is_info() {
        let finding = single(include_str!("../../fixtures/nmap_ssh.xml"));

        assert_eq!(finding.severity, Severity::Info);
        assert_eq!(finding.title, "Open Port: 22/tcp");
        assert_eq!(finding.port, Some(22));
        assert_eq!(finding.protocol.as_deref(), Some("tcp"));
        assert_eq!(finding.service.as_deref(), Some("ssh"));
        assert_eq!(finding.version.as_deref(), Some("OpenSSH 7.4"));
        assert_eq!(finding.category, "Network Exposure");
        assert_eq!(finding.affected_component, "192.168.1.10");
        assert_eq!(finding.cvss_score, 0.0);
        assert!(finding.cve_ids.is_empty());
        assert!(finding.description.contains("192.168.1.10"));
        assert!(finding.description.contains("ssh"));
        assert_eq!(finding.remediation, DEFAULT_REMEDIATION);
    }

    #[test]
    fn vulners_records_merge_into_one_finding_per_port() {
        let xml = include_str!("../../fixtures/nmap_vulners.xml");
        let findings = parse_nmap_xml(xml).unwrap();
        assert_eq!(findings.len(), 3);

        let ssh = &findings[0];
        assert_eq!(ssh.port, Some(22));
        assert_eq!(ssh.severity, Severity::Critical);
        assert_eq!(ssh.cvss_score, 9.2);
        assert_eq!(
            ssh.cve_ids.iter().map(String::as_str).collect::<Vec<_>>(),
            ["CVE-2018-15473", "CVE-2023-38408"]
        );
        assert_eq!(
            ssh.references,
            [
                "https://vulners.com/cve/CVE-2018-15473",
                "https://nvd.nist.gov/vuln/detail/CVE-2023-38408",
                "https://vulners.com/cve/CVE-2023-38408",
            ]
        );
        assert!(ssh.description.contains("CVE-2018-15473 (CVSS 5.0)"));
        assert!(ssh.description.contains("CVE-2023-38408 (CVSS 9.2)"));
        assert!(ssh.remediation.starts_with(DEFAULT_REMEDIATION));
        assert!(ssh.remediation.contains("fixes CVE-2023-38408"));

        let http = &findings[1];
        assert_eq!(http.port, Some(80));
        assert_eq!(http.severity, Severity::High);
        assert_eq!(http.cvss_score, 8.9);
        // exploit-db entries are not CVEs and must not leak into the set
        assert_eq!(http.cve_ids.len(), 1);

        let dns = &findings[2];
        assert_eq!(dns.protocol.as_deref(), Some("udp"));
        assert_eq!(dns.affected_component, "192.168.1.11");
        assert_eq!(dns.severity, Severity::Info);
    }

    #[test]
    fn zero_score_records_keep_info_severity() {
        let xml = r#"<nmaprun><host><address addr="10.0.0.5" addrtype="ipv4"/><ports>
            <port protocol="tcp" portid="8080"><state state="open"/><service name="http-proxy"/>
              <script id="vulners" output="">
                <table key="cpe:/a:x:y">
                  <table><elem key="id">CVE-2020-0001</elem><elem key="cvss">not-a-number</elem></table>
                </table>
              </script>
            </port></ports></host></nmaprun>"#;
        let finding = single(xml);
        assert_eq!(finding.severity, Severity::Info);
        assert_eq!(finding.cvss_score, 0.0);
        assert!(finding.cve_ids.contains("CVE-2020-0001"));
    }

    #[test]
    fn non_open_ports_are_ignored() {
        let xml = r#"<nmaprun><host><address addr="10.0.0.6" addrtype="ipv4"/><ports>
            <port protocol="tcp" portid="25"><state state="closed"/></port>
            <port protocol="tcp" portid="139"><state state="filtered"/></port>
            <port protocol="udp" portid="161"><state state="open|filtered"/></port>
            </ports></host><host><address addr="10.0.0.7" addrtype="ipv4"/></host></nmaprun>"#;
        assert!(parse_nmap_xml(xml).unwrap().is_empty());
    }

    #[test]
    fn mac_address_is_not_the_affected_component() {
        let xml = r#"<nmaprun><host>
            <address addr="AA:BB:CC:DD:EE:FF" addrtype="mac"/>
            <address addr="10.0.0.8" addrtype="ipv4"/>
            <ports><port protocol="tcp" portid="443"><state state="open"/></port></ports>
            </host></nmaprun>"#;
        let finding = single(xml);
        assert_eq!(finding.affected_component, "10.0.0.8");
        assert_eq!(finding.service, None);
        assert!(finding.description.contains("Service: unknown"));
    }

    #[test]
    fn malformed_output_degrades_to_one_critical_finding() {
        for raw in [
            "",
            "Starting Nmap 7.94 ( https://nmap.org )",
            r#"<nmaprun><host><address addr="1.2.3.4"/><ports><port protocol="tcp""#,
        ] {
            let findings = findings_from_xml(raw);
            assert_eq!(findings.len(), 1, "input {raw:?}");
            assert_eq!(findings[0].severity, Severity::Critical);
            assert_eq!(findings[0].title, "Output Parse Error");
            assert!(findings[0].description.contains("could not be parsed"));
        }
    }

    #[test]
    fn parsing_is_deterministic() {
        let xml = include_str!("../../fixtures/nmap_vulners.xml");
        assert_eq!(findings_from_xml(xml), findings_from_xml(xml));
        let broken = "<nmaprun><host>";
        assert_eq!(findings_from_xml(broken), findings_from_xml(broken));
    }
}
