use anyhow::{anyhow, Context, Result};
use aya::maps::{Map, MapData, MapType, ProgramArray};
use aya::programs::ProgramFd;
use log::info;
use ratelimiting_common::NEXT_STAGE_INDEX;
use std::fs;
use std::path::{Path, PathBuf};

/// The slot a stage dispatches to after its own verdict.
pub trait LinkageStore {
    type Program;

    fn set_successor(&mut self, program: &Self::Program) -> Result<()>;

    fn clear_successor(&mut self) -> Result<()>;
}

/// Namespace where stages publish their linkage stores so that the next
/// stage loaded can find them.
pub trait LinkageRegistry {
    type Store: LinkageStore;
    /// A linkage store created by this process, not yet discoverable.
    type Owned;

    fn lookup(&self, path: &Path) -> Result<Self::Store>;

    fn publish(&self, store: &mut Self::Owned, path: &Path) -> Result<()>;

    fn remove(&self, path: &Path) -> Result<()>;
}

pub type StageProgram<R> = <<R as LinkageRegistry>::Store as LinkageStore>::Program;

/// Program arrays pinned on the BPF filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct PinnedRegistry;

impl LinkageStore for ProgramArray<MapData> {
    type Program = ProgramFd;

    fn set_successor(&mut self, program: &ProgramFd) -> Result<()> {
        self.set(NEXT_STAGE_INDEX, program, 0)?;
        Ok(())
    }

    fn clear_successor(&mut self) -> Result<()> {
        self.clear_index(&NEXT_STAGE_INDEX)?;
        Ok(())
    }
}

impl LinkageRegistry for PinnedRegistry {
    type Store = ProgramArray<MapData>;
    type Owned = Map;

    fn lookup(&self, path: &Path) -> Result<ProgramArray<MapData>> {
        let map_data = MapData::from_pin(path)
            .map_err(|e| anyhow!("failed to open pinned map {}: {}", path.display(), e))?;
        let map_type = map_data
            .info()
            .and_then(|info| info.map_type())
            .map_err(|e| anyhow!("failed to query map info of {}: {}", path.display(), e))?;
        if map_type != MapType::ProgramArray {
            return Err(anyhow!(
                "{} is not a program array: {:?}",
                path.display(),
                map_type
            ));
        }
        ProgramArray::try_from(Map::ProgramArray(map_data))
            .map_err(|e| anyhow!("{} is not a program array: {}", path.display(), e))
    }

    fn publish(&self, store: &mut Map, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        store
            .pin(path)
            .map_err(|e| anyhow!("failed to pin map at {}: {}", path.display(), e))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
    }
}

/// Links one stage into the chain: registers it as the upstream stage's
/// successor and publishes its own linkage point for a downstream stage.
pub struct ChainLinker<R> {
    registry: R,
    upstream: PathBuf,
    own: PathBuf,
}

impl<R: LinkageRegistry> ChainLinker<R> {
    pub fn new(registry: R, upstream: PathBuf, own: PathBuf) -> Self {
        ChainLinker {
            registry,
            upstream,
            own,
        }
    }

    pub fn upstream_path(&self) -> &Path {
        &self.upstream
    }

    pub fn own_path(&self) -> &Path {
        &self.own
    }

    fn open_upstream(&self) -> Result<R::Store> {
        self.registry.lookup(&self.upstream).with_context(|| {
            format!(
                "Failed to fetch previous stage in the chain at {}",
                self.upstream.display()
            )
        })
    }

    /// Both failures here leave the stage outside the chain and are fatal.
    pub fn link(&self, program: &StageProgram<R>, own_store: &mut R::Owned) -> Result<()> {
        {
            let mut upstream = self.open_upstream()?;
            upstream
                .set_successor(program)
                .context("Failed to update program in the chain")?;
            // upstream handle must be closed before anything else happens,
            // a later stage replaces this entry through its own handle
        }
        info!(
            "Registered as successor of {}",
            self.upstream.display()
        );

        match self.registry.lookup(&self.own) {
            Ok(_) => info!(
                "Linkage point already published at {}",
                self.own.display()
            ),
            Err(e) => {
                info!(
                    "No linkage point at {} ({:#}), publishing one",
                    self.own.display(),
                    e
                );
                self.registry
                    .publish(own_store, &self.own)
                    .context("Failed to publish linkage point for the next stage")?;
            }
        }

        Ok(())
    }

    /// Remove this stage from the upstream stage's slot.
    pub fn unlink_upstream(&self) -> Result<()> {
        let mut upstream = self.open_upstream()?;
        upstream
            .clear_successor()
            .context("Failed to remove program from the chain")
    }

    /// Remove this stage's published linkage point.
    pub fn withdraw(&self) -> Result<()> {
        self.registry.remove(&self.own)
    }
}
