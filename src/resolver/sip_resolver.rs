use super::{Hop, LookupSource};
use crate::{Error, Result};
use rand::Rng;
use rsip::{Domain, Port, Transport};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

#[cfg(feature = "srv_lookup")]
pub struct HickorySource(std::sync::Arc<hickory_resolver::TokioResolver>);

#[cfg(feature = "srv_lookup")]
impl HickorySource {
    pub fn new() -> Result<Self> {
        let resolver = hickory_resolver::TokioResolver::builder_tokio()
            .map_err(|e| Error::Configuration(format!("dns resolver: {}", e)))?
            .build();
        Ok(Self(std::sync::Arc::new(resolver)))
    }
}

#[cfg(feature = "srv_lookup")]
#[async_trait::async_trait]
impl LookupSource for HickorySource {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        let records = self
            .0
            .srv_lookup(name)
            .await
            .map_err(|e| Error::Error(e.to_string()))?;
        Ok(records
            .iter()
            .map(|r| SrvRecord {
                target: r.target().to_string().trim_end_matches('.').to_string(),
                port: r.port(),
                priority: r.priority(),
                weight: r.weight(),
            })
            .collect())
    }

    async fn lookup_a_aaaa(&self, name: &str) -> Result<Vec<IpAddr>> {
        let records = self
            .0
            .lookup_ip(name)
            .await
            .map_err(|e| Error::Error(e.to_string()))?;
        Ok(records.iter().collect())
    }
}

fn default_transport(transport: Option<Transport>, secure: bool) -> Transport {
    transport.unwrap_or(if secure { Transport::Tls } else { Transport::Udp })
}

/// RFC 3263 resolution: SRV ordered by priority and weight, A/AAAA fallback.
pub async fn resolve_hops<S: LookupSource + ?Sized>(
    source: &S,
    domain: &Domain,
    port: Option<Port>,
    transport: Option<Transport>,
    secure: bool,
) -> Result<Vec<Hop>> {
    let name = domain.to_string();

    if let Ok(ip) = IpAddr::from_str(&name) {
        let t = default_transport(transport, secure);
        let port: u16 = port.map(Into::into).unwrap_or_else(|| t.default_port().into());
        return Ok(vec![Hop::new(SocketAddr::new(ip, port), t)]);
    }

    if let Some(port) = port {
        let t = default_transport(transport, secure);
        let port: u16 = port.into();
        let hops: Vec<Hop> = source
            .lookup_a_aaaa(&name)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|ip| Hop::new(SocketAddr::new(ip, port), t))
            .collect();
        if hops.is_empty() {
            return Err(Error::Error(format!("could not resolve {}", name)));
        }
        return Ok(hops);
    }

    let candidates = match (transport, secure) {
        (Some(t), _) => vec![t],
        (None, true) => vec![Transport::Tls],
        (None, false) => vec![Transport::Udp, Transport::Tcp],
    };

    let mut hops = Vec::new();
    for t in candidates {
        let Some(prefix) = srv_prefix(t, secure) else {
            continue;
        };
        let records = match source.lookup_srv(&format!("{}.{}", prefix, name)).await {
            Ok(records) => records,
            Err(_) => continue,
        };
        for rec in order_srv_records(records) {
            if let Ok(ips) = source.lookup_a_aaaa(&rec.target).await {
                hops.extend(ips.into_iter().map(|ip| Hop::new(SocketAddr::new(ip, rec.port), t)));
            }
        }
    }
    if !hops.is_empty() {
        return Ok(hops);
    }

    let t = default_transport(transport, secure);
    let port: u16 = t.default_port().into();
    match source.lookup_a_aaaa(&name).await {
        Ok(ips) if !ips.is_empty() => Ok(ips
            .into_iter()
            .map(|ip| Hop::new(SocketAddr::new(ip, port), t))
            .collect()),
        _ => Err(Error::Error(format!("resolution failed for {}", name))),
    }
}

fn srv_prefix(transport: Transport, secure: bool) -> Option<&'static str> {
    match (transport, secure) {
        (Transport::Udp, false) => Some("_sip._udp"),
        (Transport::Tcp, false) => Some("_sip._tcp"),
        (Transport::Tls, _) | (Transport::Tcp, true) | (Transport::Wss, true) => Some("_sips._tcp"),
        _ => None,
    }
}

/// Priority ascending; within one priority, weighted random selection.
fn order_srv_records(mut records: Vec<SrvRecord>) -> Vec<SrvRecord> {
    records.sort_by_key(|r| r.priority);

    let mut ordered = Vec::with_capacity(records.len());
    let mut rng = rand::rng();
    while !records.is_empty() {
        let priority = records[0].priority;
        let split = records
            .iter()
            .position(|r| r.priority != priority)
            .unwrap_or(records.len());
        let mut group: Vec<SrvRecord> = records.drain(..split).collect();

        while !group.is_empty() {
            let total: u32 = group.iter().map(|r| r.weight as u32).sum();
            let idx = if total == 0 {
                rng.random_range(0..group.len())
            } else {
                let mut pick = rng.random_range(0..=total);
                group
                    .iter()
                    .position(|r| {
                        let w = r.weight as u32;
                        if pick <= w {
                            true
                        } else {
                            pick -= w;
                            false
                        }
                    })
                    .unwrap_or(group.len() - 1)
            };
            ordered.push(group.remove(idx));
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockDns {
        srv: Mutex<HashMap<String, Vec<SrvRecord>>>,
        a: Mutex<HashMap<String, Vec<IpAddr>>>,
    }

    impl MockDns {
        fn srv(&self, name: &str, target: &str, port: u16, priority: u16, weight: u16) {
            self.srv
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push(SrvRecord {
                    target: target.to_string(),
                    port,
                    priority,
                    weight,
                });
        }

        fn a(&self, name: &str, ip: &str) {
            self.a
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push(ip.parse().unwrap());
        }
    }

    #[async_trait::async_trait]
    impl LookupSource for MockDns {
        async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
            self.srv
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Error("not found".to_string()))
        }

        async fn lookup_a_aaaa(&self, name: &str) -> Result<Vec<IpAddr>> {
            self.a
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Error("not found".to_string()))
        }
    }

    fn domain(name: &str) -> Domain {
        Domain::from(name.to_string())
    }

    #[tokio::test]
    async fn test_literal_address_is_single_hop() {
        let dns = MockDns::default();
        let hops = resolve_hops(&dns, &domain("192.0.2.10"), None, None, false)
            .await
            .unwrap();
        assert_eq!(hops, vec![Hop::new("192.0.2.10:5060".parse().unwrap(), Transport::Udp)]);
    }

    #[tokio::test]
    async fn test_explicit_port_skips_srv() {
        let dns = MockDns::default();
        dns.srv("_sip._tcp.trunk.example.net", "sbc1.trunk.example.net", 5070, 1, 1);
        dns.a("trunk.example.net", "198.51.100.1");

        let hops = resolve_hops(
            &dns,
            &domain("trunk.example.net"),
            Some(5090.into()),
            Some(Transport::Tcp),
            false,
        )
        .await
        .unwrap();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].addr, "198.51.100.1:5090".parse().unwrap());
        assert_eq!(hops[0].transport, Transport::Tcp);
    }

    #[tokio::test]
    async fn test_srv_priority_orders_hops() {
        let dns = MockDns::default();
        dns.srv("_sip._udp.trunk.example.net", "backup.trunk.example.net", 5060, 20, 50);
        dns.srv("_sip._udp.trunk.example.net", "primary.trunk.example.net", 5062, 10, 50);
        dns.a("primary.trunk.example.net", "198.51.100.1");
        dns.a("backup.trunk.example.net", "198.51.100.2");

        let hops = resolve_hops(&dns, &domain("trunk.example.net"), None, Some(Transport::Udp), false)
            .await
            .unwrap();
        let addrs: Vec<String> = hops.iter().map(|h| h.addr.to_string()).collect();
        assert_eq!(addrs, vec!["198.51.100.1:5062", "198.51.100.2:5060"]);
    }

    #[tokio::test]
    async fn test_falls_back_to_address_records() {
        let dns = MockDns::default();
        dns.a("trunk.example.net", "203.0.113.9");

        let hops = resolve_hops(&dns, &domain("trunk.example.net"), None, Some(Transport::Udp), false)
            .await
            .unwrap();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].addr, "203.0.113.9:5060".parse().unwrap());
    }

    #[tokio::test]
    async fn test_unresolvable_domain() {
        let dns = MockDns::default();
        let result = resolve_hops(&dns, &domain("nowhere.invalid"), None, None, false).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_weighted_ordering_keeps_every_record() {
        let records = vec![
            SrvRecord { target: "a".into(), port: 1, priority: 2, weight: 0 },
            SrvRecord { target: "b".into(), port: 1, priority: 1, weight: 10 },
            SrvRecord { target: "c".into(), port: 1, priority: 1, weight: 90 },
        ];
        let ordered = order_srv_records(records);
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[2].target, "a");
    }
}
