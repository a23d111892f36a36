//! Terminal output for the CLI
//!
//! Tables for tunnels and profiles, and colored one-line status messages.

use std::io::Write;

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use tabled::{settings::Style, Table, Tabled};

use pv_core::store::CurrentProfile;
use pv_core::types::TunnelResult;

/// Format tunnel URLs as a table, one row per URL
pub fn format_tunnels(result: &TunnelResult) -> String {
    #[derive(Tabled)]
    struct TunnelRow {
        #[tabled(rename = "SERVICE")]
        service: String,
        #[tabled(rename = "PORT")]
        port: u16,
        #[tabled(rename = "URL")]
        url: String,
    }

    let rows: Vec<TunnelRow> = result
        .tunnels
        .iter()
        .flat_map(|tunnel| {
            tunnel.ports.iter().flat_map(move |(port, urls)| {
                urls.iter().map(move |url| TunnelRow {
                    service: tunnel.service.clone(),
                    port: *port,
                    url: url.clone(),
                })
            })
        })
        .collect();

    if rows.is_empty() {
        return "No tunnels published".to_string();
    }
    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format the current profile as a table
pub fn format_profile(profile: &CurrentProfile) -> String {
    #[derive(Tabled)]
    struct ProfileRow {
        #[tabled(rename = "ALIAS")]
        alias: String,
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "LOCATION")]
        location: String,
    }

    Table::new([ProfileRow {
        alias: profile.alias.clone(),
        id: profile.id.clone(),
        location: profile.location.display().to_string(),
    }])
    .with(Style::rounded())
    .to_string()
}

fn print_styled(out: &mut impl Write, color: Color, symbol: &str, msg: &str) {
    let _ = crossterm::execute!(
        out,
        SetForegroundColor(color),
        Print(symbol),
        Print(" "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Green check on stdout
pub fn print_success(msg: &str) {
    print_styled(&mut std::io::stdout(), Color::Green, "✓", msg);
}

/// Red cross on stderr
pub fn print_error(msg: &str) {
    print_styled(&mut std::io::stderr(), Color::Red, "✗", msg);
}

/// Yellow warning sign on stderr
pub fn print_warning(msg: &str) {
    print_styled(&mut std::io::stderr(), Color::Yellow, "⚠", msg);
}

/// Cyan info sign on stdout
pub fn print_info(msg: &str) {
    print_styled(&mut std::io::stdout(), Color::Cyan, "ℹ", msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use pv_core::types::Tunnel;

    #[test]
    fn test_format_tunnels() {
        let result = TunnelResult {
            client_id: None,
            tunnels: vec![Tunnel {
                project: "demo".to_string(),
                service: "web".to_string(),
                ports: BTreeMap::from([
                    (80, vec!["https://web-80-demo.example.test".to_string()]),
                    (443, vec!["https://web-443-demo.example.test".to_string()]),
                ]),
            }],
        };

        let table = format_tunnels(&result);
        assert!(table.contains("SERVICE"));
        assert!(table.contains("https://web-80-demo.example.test"));
        assert!(table.contains("443"));
    }

    #[test]
    fn test_format_empty_tunnels() {
        assert_eq!(
            format_tunnels(&TunnelResult::default()),
            "No tunnels published"
        );
    }

    #[test]
    fn test_format_profile() {
        let table = format_profile(&CurrentProfile {
            alias: "default".to_string(),
            id: "default-1a2b".to_string(),
            location: PathBuf::from("/home/me/.config/preview/profiles/default"),
        });
        assert!(table.contains("default-1a2b"));
        assert!(table.contains("LOCATION"));
    }
}
