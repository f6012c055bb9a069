use crate::utils::port_utils::parse_port_list;
use anyhow::{anyhow, Context, Result};
use aya::maps::{HashMap, Map, MapData, MapError};
use aya::{Ebpf, Pod};
use log::{info, warn};
use ratelimiting_common::{
    CONFIG_MAP, DROP_COUNT_MAP, NEXT_STAGE_MAP, PORTS_MAP, PORT_ALLOWED, RECV_COUNT_MAP,
    REQUIRED_MAPS, SINGLE_ENTRY_KEY, WINDOW_MAP,
};

/// Key/value store shared with the data plane.
///
/// Every method is a single map operation; nothing here is atomic across calls.
pub trait SharedStore<K, V> {
    /// Returns `None` when the key is absent.
    fn lookup(&self, key: &K) -> Result<Option<V>>;

    fn update(&mut self, key: K, value: V) -> Result<()>;

    /// Returns `false` when the entry was already gone.
    fn delete(&mut self, key: &K) -> Result<bool>;

    /// Walk the key cursor once, without modifying the store.
    fn snapshot_keys(&self) -> Result<Vec<K>>;
}

impl<K: Pod, V: Pod> SharedStore<K, V> for HashMap<MapData, K, V> {
    fn lookup(&self, key: &K) -> Result<Option<V>> {
        match self.get(key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value, 0)?;
        Ok(())
    }

    fn delete(&mut self, key: &K) -> Result<bool> {
        match self.remove(key) {
            Ok(()) => Ok(true),
            Err(MapError::SyscallError(e)) if e.io_error.raw_os_error() == Some(libc::ENOENT) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn snapshot_keys(&self) -> Result<Vec<K>> {
        self.keys()
            .map(|key| key.map_err(anyhow::Error::from))
            .collect()
    }
}

/// Operator supplied values pushed into the stores during configuration.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub rate: u64,
    pub ports: Option<String>,
    pub port_delimiter: String,
}

/// The six stores of one stage.
///
/// Built once after the data-plane object is loaded; the sweeper borrows it
/// and the shutdown handler takes ownership to release the handles.
pub struct StateStores<S, P, N> {
    pub config: S,
    pub window: S,
    pub recv_count: S,
    pub drop_count: S,
    pub ports: P,
    // own linkage store, published for a downstream stage
    pub next_stage: N,
}

pub type KernelStores = StateStores<HashMap<MapData, u64, u64>, HashMap<MapData, u16, u8>, Map>;

impl KernelStores {
    /// Take all required maps out of the loaded object.
    pub fn from_ebpf(ebpf: &mut Ebpf) -> Result<Self> {
        let missing: Vec<&str> = REQUIRED_MAPS
            .iter()
            .copied()
            .filter(|name| ebpf.map(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(anyhow!(
                "Required maps not found in eBPF object: {}",
                missing.join(", ")
            ));
        }

        let next_stage = take_map(ebpf, NEXT_STAGE_MAP)?;
        if !matches!(next_stage, Map::ProgramArray(_)) {
            return Err(anyhow!("map '{}' is not a program array", NEXT_STAGE_MAP));
        }

        let stores = StateStores {
            config: take_hash_map(ebpf, CONFIG_MAP)?,
            window: take_hash_map(ebpf, WINDOW_MAP)?,
            recv_count: take_hash_map(ebpf, RECV_COUNT_MAP)?,
            drop_count: take_hash_map(ebpf, DROP_COUNT_MAP)?,
            ports: take_hash_map(ebpf, PORTS_MAP)?,
            next_stage,
        };

        info!("Acquired {} data-plane maps", REQUIRED_MAPS.len());
        Ok(stores)
    }
}

fn take_map(ebpf: &mut Ebpf, name: &str) -> Result<Map> {
    ebpf.take_map(name)
        .ok_or_else(|| anyhow!("map '{}' not found in eBPF object", name))
}

fn take_hash_map<K: Pod, V: Pod>(ebpf: &mut Ebpf, name: &str) -> Result<HashMap<MapData, K, V>> {
    HashMap::try_from(take_map(ebpf, name)?)
        .with_context(|| format!("map '{}' has an unexpected type", name))
}

impl<S, P, N> StateStores<S, P, N>
where
    S: SharedStore<u64, u64>,
    P: SharedStore<u16, u8>,
{
    /// Push the rate, zeroed counters and the port allow-list.
    ///
    /// Each value is a single write; the counters are not read first. Port
    /// tokens that do not parse are logged and skipped.
    pub fn configure(&mut self, settings: &StoreSettings) -> Result<()> {
        self.config
            .update(SINGLE_ENTRY_KEY, settings.rate)
            .with_context(|| format!("Failed to set rate limit in {}", CONFIG_MAP))?;
        self.recv_count
            .update(SINGLE_ENTRY_KEY, 0)
            .with_context(|| format!("Failed to reset {}", RECV_COUNT_MAP))?;
        self.drop_count
            .update(SINGLE_ENTRY_KEY, 0)
            .with_context(|| format!("Failed to reset {}", DROP_COUNT_MAP))?;
        info!("Rate limit set to {} connections per window", settings.rate);

        let Some(list) = settings.ports.as_deref().filter(|l| !l.is_empty()) else {
            return Ok(());
        };

        info!("Port list is {}", list);
        let parsed = parse_port_list(list, &settings.port_delimiter);
        for token in &parsed.rejected {
            warn!("Ignoring invalid port '{}' in port list", token);
        }
        for port in &parsed.ports {
            self.ports
                .update(*port, PORT_ALLOWED)
                .with_context(|| format!("Failed to allow port {} in {}", port, PORTS_MAP))?;
        }
        info!("Allowed {} destination ports", parsed.ports.len());

        Ok(())
    }

    /// Current (received, dropped) counter values maintained by the data plane.
    pub fn counters(&self) -> Result<(u64, u64)> {
        let received = self.recv_count.lookup(&SINGLE_ENTRY_KEY)?.unwrap_or(0);
        let dropped = self.drop_count.lookup(&SINGLE_ENTRY_KEY)?.unwrap_or(0);
        Ok((received, dropped))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::memory_stores;
    use super::*;

    fn settings(rate: u64, ports: Option<&str>) -> StoreSettings {
        StoreSettings {
            rate,
            ports: ports.map(str::to_string),
            port_delimiter: ",".to_string(),
        }
    }

    #[test]
    fn test_configure_writes_rate_and_zeroed_counters() {
        let mut stores = memory_stores();
        stores.recv_count.entries.insert(SINGLE_ENTRY_KEY, 42);

        stores.configure(&settings(100, Some("22,80"))).unwrap();

        assert_eq!(stores.config.entries.get(&0), Some(&100));
        assert_eq!(stores.recv_count.entries.get(&0), Some(&0));
        assert_eq!(stores.drop_count.entries.get(&0), Some(&0));
        assert_eq!(
            stores.ports.entries.iter().collect::<Vec<_>>(),
            vec![(&22, &1), (&80, &1)]
        );
    }

    #[test]
    fn test_configure_port_list_exact_membership() {
        let mut stores = memory_stores();
        stores.configure(&settings(10, Some("80, 443 ,8080"))).unwrap();

        let ports: Vec<(u16, u8)> = stores.ports.entries.clone().into_iter().collect();
        assert_eq!(ports, vec![(80, 1), (443, 1), (8080, 1)]);
    }

    #[test]
    fn test_configure_skips_malformed_ports() {
        let mut stores = memory_stores();
        stores.configure(&settings(10, Some("80,http, 443"))).unwrap();

        assert_eq!(stores.ports.entries.len(), 2);
        assert!(!stores.ports.entries.contains_key(&0));
    }

    #[test]
    fn test_configure_without_ports_leaves_allow_list_empty() {
        let mut stores = memory_stores();
        stores.configure(&settings(5, None)).unwrap();
        stores.configure(&settings(5, Some(""))).unwrap();

        assert!(stores.ports.entries.is_empty());
        assert_eq!(stores.config.entries.get(&0), Some(&5));
    }

    #[test]
    fn test_configure_fails_when_store_rejects_update() {
        let mut stores = memory_stores();
        stores.config.fail_updates = true;

        let err = stores.configure(&settings(5, None)).unwrap_err();
        assert!(err.to_string().contains(CONFIG_MAP));
    }

    #[test]
    fn test_counters_default_to_zero() {
        let mut stores = memory_stores();
        assert_eq!(stores.counters().unwrap(), (0, 0));

        stores.recv_count.entries.insert(0, 7);
        stores.drop_count.entries.insert(0, 2);
        assert_eq!(stores.counters().unwrap(), (7, 2));
    }
}
