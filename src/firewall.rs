//! Firewall enforcement against the host packet filter.
//!
//! Blocked sources land in an isolated chain in the `filter` table; the
//! chain is reached through a jump rule inserted at the head of `INPUT`
//! for new-state traffic. The chain is torn down and recreated on
//! startup so the process always begins from a known clean state, and
//! removed again on shutdown.

use std::net::{IpAddr, Ipv4Addr};

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::config::FirewallConfig;

const FILTER_TABLE: &str = "filter";
const INPUT_CHAIN: &str = "INPUT";

/// Capability interface the enforce stage works against.
pub trait Firewall: Send + Sync {
    /// Drop all further traffic from `addr`. Idempotent: repeated calls
    /// for the same address leave exactly one rule.
    fn block(&self, addr: Ipv4Addr) -> Result<()>;
    /// Remove the jump rule and the isolated chain. Safe to call when
    /// the chain does not exist.
    fn close(&self) -> Result<()>;
}

/// Rule-manipulation operations the packet-filter control interface
/// must provide. Mirrored by the production iptables backend and by an
/// in-memory recording backend in tests.
pub trait RuleBackend: Send + Sync {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool>;
    fn new_chain(&self, table: &str, chain: &str) -> Result<()>;
    fn insert(&self, table: &str, chain: &str, position: i32, rule: &str) -> Result<()>;
    /// Append `rule` unless an identical rule is already present.
    fn append_unique(&self, table: &str, chain: &str, rule: &str) -> Result<()>;
    /// Delete `rule`; no-op when absent.
    fn delete_if_exists(&self, table: &str, chain: &str, rule: &str) -> Result<()>;
    fn clear_and_delete_chain(&self, table: &str, chain: &str) -> Result<()>;
}

/// Production backend over the `iptables` binary.
pub struct IptablesBackend {
    inner: iptables::IPTables,
}

impl IptablesBackend {
    pub fn new() -> Result<Self> {
        let inner = iptables::new(false).map_err(stringify_err)?;
        Ok(Self { inner })
    }
}

// The iptables crate surfaces `Box<dyn Error>` without Send + Sync;
// flatten to a message so errors can cross task boundaries.
fn stringify_err(e: Box<dyn std::error::Error>) -> anyhow::Error {
    anyhow!("{e}")
}

impl RuleBackend for IptablesBackend {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        self.inner.chain_exists(table, chain).map_err(stringify_err)
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.inner.new_chain(table, chain).map_err(stringify_err)
    }

    fn insert(&self, table: &str, chain: &str, position: i32, rule: &str) -> Result<()> {
        self.inner
            .insert(table, chain, rule, position)
            .map_err(stringify_err)
    }

    fn append_unique(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        if self.inner.exists(table, chain, rule).map_err(stringify_err)? {
            return Ok(());
        }
        self.inner.append(table, chain, rule).map_err(stringify_err)
    }

    fn delete_if_exists(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        if !self.inner.exists(table, chain, rule).map_err(stringify_err)? {
            return Ok(());
        }
        self.inner.delete(table, chain, rule).map_err(stringify_err)
    }

    fn clear_and_delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.inner.flush_chain(table, chain).map_err(stringify_err)?;
        self.inner.delete_chain(table, chain).map_err(stringify_err)
    }
}

/// [`Firewall`] implementation managing an isolated iptables chain.
pub struct IptablesFirewall {
    backend: Box<dyn RuleBackend>,
    chain: String,
    jump_rule: String,
    allow_list: Vec<Ipv4Addr>,
}

impl IptablesFirewall {
    /// Build the production firewall for `interface` and bring the
    /// chain into a known clean state. Initialization failure is fatal
    /// to startup: enforcement invariants cannot be guaranteed without
    /// it.
    pub fn new(interface: &str, config: &FirewallConfig) -> Result<Self> {
        let mut allow_list = config.allow_list.clone();
        match local_device_ipv4(interface)? {
            Some(local_ip) => allow_list.push(local_ip),
            None => warn!(
                interface,
                "capture device has no IPv4 address, allow list holds configured entries only"
            ),
        }

        let backend = Box::new(IptablesBackend::new().context("failed to open iptables handle")?);
        let fw = Self::with_backend(backend, &config.chain, allow_list);
        fw.initialize()
            .with_context(|| format!("failed to initialize firewall chain {}", config.chain))?;
        Ok(fw)
    }

    /// Assemble over an arbitrary backend without touching the host;
    /// `initialize` must be called separately.
    pub fn with_backend(
        backend: Box<dyn RuleBackend>,
        chain: &str,
        allow_list: Vec<Ipv4Addr>,
    ) -> Self {
        Self {
            backend,
            chain: chain.to_string(),
            jump_rule: format!("-m state --state NEW -j {chain}"),
            allow_list,
        }
    }

    /// Tear down any stale chain from a previous run, then create the
    /// chain and hook it into `INPUT`.
    pub fn initialize(&self) -> Result<()> {
        self.teardown()?;
        if !self.backend.chain_exists(FILTER_TABLE, &self.chain)? {
            self.backend.new_chain(FILTER_TABLE, &self.chain)?;
        }
        self.backend
            .insert(FILTER_TABLE, INPUT_CHAIN, 1, &self.jump_rule)?;
        info!(chain = %self.chain, "firewall chain installed");
        Ok(())
    }

    fn teardown(&self) -> Result<()> {
        if !self.backend.chain_exists(FILTER_TABLE, &self.chain)? {
            return Ok(());
        }
        self.backend
            .delete_if_exists(FILTER_TABLE, INPUT_CHAIN, &self.jump_rule)?;
        self.backend
            .clear_and_delete_chain(FILTER_TABLE, &self.chain)?;
        Ok(())
    }
}

impl Firewall for IptablesFirewall {
    fn block(&self, addr: Ipv4Addr) -> Result<()> {
        if self.allow_list.contains(&addr) {
            warn!(%addr, "address is on the allow list, skipping block");
            return Ok(());
        }
        self.backend
            .append_unique(FILTER_TABLE, &self.chain, &format!("-s {addr} -j DROP"))
            .with_context(|| format!("failed to block {addr}"))?;
        info!(%addr, chain = %self.chain, "blocked source address");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.teardown()
            .with_context(|| format!("failed to remove firewall chain {}", self.chain))
    }
}

/// First IPv4 address of the named capture device, used to keep the
/// monitored host off its own block list. Errors when the device does
/// not exist at all.
pub fn local_device_ipv4(interface: &str) -> Result<Option<Ipv4Addr>> {
    let devices = pcap::Device::list().context("failed to enumerate capture devices")?;
    let device = devices
        .into_iter()
        .find(|d| d.name == interface)
        .ok_or_else(|| anyhow!("capture device {interface} does not exist"))?;

    Ok(device.addresses.iter().find_map(|a| match a.addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory packet filter tracking chain presence and rule lists,
    /// with append-unique / delete-if-exists semantics matching the
    /// real binary.
    #[derive(Default)]
    pub(crate) struct MemoryBackend {
        pub state: Mutex<MemoryState>,
    }

    #[derive(Default)]
    pub(crate) struct MemoryState {
        pub chain_present: bool,
        pub chain_rules: Vec<String>,
        pub input_rules: Vec<String>,
    }

    impl RuleBackend for MemoryBackend {
        fn chain_exists(&self, _table: &str, _chain: &str) -> Result<bool> {
            Ok(self.state.lock().unwrap().chain_present)
        }

        fn new_chain(&self, _table: &str, _chain: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.chain_present {
                return Err(anyhow!("chain already exists"));
            }
            state.chain_present = true;
            Ok(())
        }

        fn insert(&self, _table: &str, chain: &str, position: i32, rule: &str) -> Result<()> {
            assert_eq!(chain, INPUT_CHAIN);
            let mut state = self.state.lock().unwrap();
            let index = (position as usize).saturating_sub(1).min(state.input_rules.len());
            state.input_rules.insert(index, rule.to_string());
            Ok(())
        }

        fn append_unique(&self, _table: &str, _chain: &str, rule: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.chain_rules.iter().any(|r| r == rule) {
                state.chain_rules.push(rule.to_string());
            }
            Ok(())
        }

        fn delete_if_exists(&self, _table: &str, chain: &str, rule: &str) -> Result<()> {
            assert_eq!(chain, INPUT_CHAIN);
            let mut state = self.state.lock().unwrap();
            state.input_rules.retain(|r| r != rule);
            Ok(())
        }

        fn clear_and_delete_chain(&self, _table: &str, _chain: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.chain_present {
                return Err(anyhow!("chain does not exist"));
            }
            state.chain_rules.clear();
            state.chain_present = false;
            Ok(())
        }
    }

    fn firewall_with(allow_list: Vec<Ipv4Addr>) -> (IptablesFirewall, std::sync::Arc<MemoryBackend>) {
        let backend = std::sync::Arc::new(MemoryBackend::default());
        let fw = IptablesFirewall::with_backend(
            Box::new(SharedBackend(backend.clone())),
            "synban",
            allow_list,
        );
        (fw, backend)
    }

    /// Arc wrapper so tests can keep inspecting the backend after
    /// handing it to the firewall.
    struct SharedBackend(std::sync::Arc<MemoryBackend>);

    impl RuleBackend for SharedBackend {
        fn chain_exists(&self, t: &str, c: &str) -> Result<bool> {
            self.0.chain_exists(t, c)
        }
        fn new_chain(&self, t: &str, c: &str) -> Result<()> {
            self.0.new_chain(t, c)
        }
        fn insert(&self, t: &str, c: &str, p: i32, r: &str) -> Result<()> {
            self.0.insert(t, c, p, r)
        }
        fn append_unique(&self, t: &str, c: &str, r: &str) -> Result<()> {
            self.0.append_unique(t, c, r)
        }
        fn delete_if_exists(&self, t: &str, c: &str, r: &str) -> Result<()> {
            self.0.delete_if_exists(t, c, r)
        }
        fn clear_and_delete_chain(&self, t: &str, c: &str) -> Result<()> {
            self.0.clear_and_delete_chain(t, c)
        }
    }

    #[test]
    fn block_appends_one_drop_rule() {
        let (fw, backend) = firewall_with(vec![]);
        fw.initialize().unwrap();

        let addr = Ipv4Addr::new(192, 169, 0, 1);
        fw.block(addr).unwrap();
        fw.block(addr).unwrap();

        let state = backend.state.lock().unwrap();
        assert_eq!(state.chain_rules, vec!["-s 192.169.0.1 -j DROP"]);
    }

    #[test]
    fn allow_listed_address_is_never_blocked() {
        let allowed = Ipv4Addr::new(192, 169, 0, 2);
        let (fw, backend) = firewall_with(vec![allowed]);
        fw.initialize().unwrap();

        for _ in 0..3 {
            fw.block(allowed).unwrap();
        }

        assert!(backend.state.lock().unwrap().chain_rules.is_empty());
    }

    #[test]
    fn initialize_installs_chain_and_jump_rule() {
        let (fw, backend) = firewall_with(vec![]);
        fw.initialize().unwrap();

        let state = backend.state.lock().unwrap();
        assert!(state.chain_present);
        assert_eq!(
            state.input_rules,
            vec!["-m state --state NEW -j synban"]
        );
    }

    #[test]
    fn initialize_then_close_round_trips_to_clean_state() {
        let (fw, backend) = firewall_with(vec![]);
        fw.initialize().unwrap();
        fw.block(Ipv4Addr::new(10, 1, 1, 1)).unwrap();
        fw.close().unwrap();

        let state = backend.state.lock().unwrap();
        assert!(!state.chain_present);
        assert!(state.chain_rules.is_empty());
        assert!(state.input_rules.is_empty());
    }

    #[test]
    fn close_is_a_noop_without_a_chain() {
        let (fw, backend) = firewall_with(vec![]);
        fw.close().unwrap();
        assert!(!backend.state.lock().unwrap().chain_present);
    }

    #[test]
    fn initialize_replaces_a_stale_chain() {
        let (fw, backend) = firewall_with(vec![]);
        {
            let mut state = backend.state.lock().unwrap();
            state.chain_present = true;
            state.chain_rules.push("-s 1.2.3.4 -j DROP".to_string());
            state.input_rules.push("-m state --state NEW -j synban".to_string());
        }

        fw.initialize().unwrap();

        let state = backend.state.lock().unwrap();
        assert!(state.chain_present);
        assert!(state.chain_rules.is_empty());
        assert_eq!(state.input_rules.len(), 1);
    }
}
