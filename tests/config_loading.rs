use std::fs;
use std::net::Ipv4Addr;

use tempfile::TempDir;

use nextdhcp::config::CONFIG_FILE_NAME;
use nextdhcp::{Config, Error};

const TWO_SUBNETS: &str = r#"{
    "server_ip": "192.168.1.2",
    "serve_cached_renewals": true,
    "subnets": [
        {
            "id": "office",
            "network": "192.168.1.0/24",
            "pools": [
                { "start": "192.168.1.100", "end": "192.168.1.199", "exclusions": ["192.168.1.150"] }
            ],
            "reservations": [
                { "mac_address": "aa:bb:cc:dd:ee:01", "ip_address": "192.168.1.10", "hostname": "printer" }
            ],
            "gateway": "192.168.1.1",
            "dns_servers": ["192.168.1.1"],
            "lease_duration_seconds": 7200
        },
        {
            "id": "lab",
            "network": "10.20.0.0/16",
            "pools": [
                { "start": "10.20.1.1", "end": "10.20.1.50", "lease_duration_seconds": 600 }
            ],
            "lease_duration_seconds": 3600,
            "renewal_time_seconds": 900,
            "rebinding_time_seconds": 2700
        }
    ]
}"#;

fn write_config(dir: &TempDir, content: &str) {
    fs::write(dir.path().join(CONFIG_FILE_NAME), content).unwrap();
}

#[test]
fn loads_config_from_directory() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, TWO_SUBNETS);

    let config = Config::load(dir.path()).unwrap();

    assert_eq!(config.server_ip, Some(Ipv4Addr::new(192, 168, 1, 2)));
    assert!(config.serve_cached_renewals);
    assert_eq!(config.offer_timeout_seconds, 60);
    assert_eq!(config.subnets.len(), 2);

    let office = config.subnet("office").unwrap();
    assert_eq!(office.reservations[0].hostname.as_deref(), Some("printer"));
    assert_eq!(office.pools[0].exclusions, vec![Ipv4Addr::new(192, 168, 1, 150)]);
    assert_eq!(office.renewal_time(7200), 3600);

    let lab = config.subnet("lab").unwrap();
    assert_eq!(lab.pools[0].lease_duration_seconds, Some(600));
    assert_eq!(lab.renewal_time(3600), 900);
    assert_eq!(lab.rebinding_time(3600), 2700);
}

#[test]
fn loads_config_from_file_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.json");
    fs::write(&path, TWO_SUBNETS).unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.subnets[0].id, "office");
}

#[test]
fn missing_file_is_fatal() {
    let dir = TempDir::new().unwrap();

    let result = Config::load(dir.path());
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn malformed_json_is_fatal() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "{ \"server_ip\": ");

    let result = Config::load(dir.path());
    assert!(matches!(result, Err(Error::Json(_))));
}

#[test]
fn missing_required_field_is_fatal() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"{ "server_ip": "192.168.1.2", "subnets": [ { "id": "office", "pools": [] } ] }"#,
    );

    let result = Config::load(dir.path());
    assert!(matches!(result, Err(Error::Json(_))));
}

#[test]
fn failed_validation_is_fatal() {
    let dir = TempDir::new().unwrap();
    let gateway_in_pool = TWO_SUBNETS.replace(
        "\"gateway\": \"192.168.1.1\"",
        "\"gateway\": \"192.168.1.120\"",
    );
    write_config(&dir, &gateway_in_pool);

    let result = Config::load(dir.path());
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn saved_default_config_loads_back() {
    let dir = TempDir::new().unwrap();

    Config::default().save(dir.path()).unwrap();
    assert!(dir.path().join(CONFIG_FILE_NAME).is_file());

    let config = Config::load(dir.path()).unwrap();
    assert_eq!(config.subnets.len(), 1);
    assert_eq!(config.subnets[0].id, "lan");
}
