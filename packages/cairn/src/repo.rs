//! The repository: discovery, layout, and shared services.
//!
//! A cairn repo is any directory containing `.cairn/`. Everything the
//! engine needs hangs off [`Repo`]: the object database and run cache
//! under `.cairn/cache/`, the state index and advisory lock under
//! `.cairn/tmp/`, the compiled ignore rules, the configured linker, and
//! the SCM hook. The user-facing operations (`add`, `reproduce`,
//! `checkout`, ...) live in the `repo::*` submodules as methods on this
//! type.

mod add;
mod checkout;
mod fetch;
mod gc;
mod push;
mod reproduce;
mod status;

pub use checkout::{CheckoutError, CheckoutReport};
pub use gc::GcReport;

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use derive_more::Display;
use tokio::task::spawn_blocking;
use tracing::{debug, instrument};

use crate::{
    config::Config,
    fs::{self, LockFile, Locked},
    ignorefile::IgnoreRules,
    link::Linker,
    odb::Odb,
    path::{AbsDirPath, TryJoinWith as _},
    pipeline::{execute::Remote, run_cache::RunCache},
    remote::{FsRemote, RemoteIndex},
    scm::{self, Scm},
    state::StateIndex,
};

/// Name of the repo metadata directory.
pub const REPO_DIR: &str = ".cairn";

/// Environment variable overriding repo root discovery.
pub const ROOT_ENV: &str = "CAIRN_ROOT";

/// The path is not inside a cairn repository.
#[derive(Clone, Debug, Display, derive_more::Error)]
#[display("no {REPO_DIR} directory found in '{start}' or any parent")]
pub struct NotARepo {
    pub start: String,
}

/// An open repository.
#[derive(Display)]
#[display("{root}")]
pub struct Repo {
    root: AbsDirPath,
    config: Config,
    odb: Odb,
    run_cache: RunCache,
    state: StateIndex,
    ignore: IgnoreRules,
    linker: Linker,
    scm: Box<dyn Scm>,
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo").field("root", &self.root).finish()
    }
}

impl Repo {
    /// Find the repo containing the current directory.
    ///
    /// `CAIRN_ROOT` overrides the walk when set.
    #[instrument(name = "Repo::discover")]
    pub async fn discover() -> Result<Self> {
        if let Ok(root) = std::env::var(ROOT_ENV) {
            let root = AbsDirPath::try_from(root.as_str())
                .with_context(|| format!("parse {ROOT_ENV}"))?;
            return Self::open(&root).await;
        }

        let start = AbsDirPath::current()?;
        let mut cursor = Some(start.clone());
        while let Some(dir) = cursor {
            let marker = dir.try_join_dir(REPO_DIR)?;
            if fs::is_dir(marker.as_std_path()).await {
                return Self::open(&dir).await;
            }
            cursor = dir.parent();
        }

        Err(NotARepo {
            start: start.to_string(),
        }
        .into())
    }

    /// Open the repo rooted at `root`. Fails if it was never initialized.
    #[instrument(name = "Repo::open")]
    pub async fn open(root: &AbsDirPath) -> Result<Self> {
        let meta = root.try_join_dir(REPO_DIR)?;
        if !fs::is_dir(meta.as_std_path()).await {
            return Err(NotARepo {
                start: root.to_string(),
            }
            .into());
        }

        let config = Config::load(&meta.try_join_file("config")?).await?;
        let odb = Odb::open(&meta.try_join_dir("cache")?).await?;
        let run_cache = RunCache::open(&meta.try_join_dir("cache")?.try_join_dir("runs")?).await?;
        let state_path = meta.try_join_dir("tmp")?.try_join_file("state.db")?;
        let state = {
            let path = state_path.as_std_path().to_path_buf();
            spawn_blocking(move || StateIndex::open_or_bypass(path))
                .await
                .map_err(|e| eyre!("join task: {e}"))?
        };
        let ignore = {
            let root = root.clone();
            spawn_blocking(move || IgnoreRules::load(&root))
                .await
                .map_err(|e| eyre!("join task: {e}"))??
        };
        let linker = Linker::new(config.link_kinds(), config.warn_slow_links());
        let scm = scm::detect(root);

        debug!(%root, "opened repo");
        Ok(Self {
            root: root.clone(),
            config,
            odb,
            run_cache,
            state,
            ignore,
            linker,
            scm,
        })
    }

    /// Initialize a new repo at `root`.
    ///
    /// Creates `.cairn/` with a default config and a `.gitignore` covering
    /// the machine-local parts. Refuses to re-initialize unless `force`.
    #[instrument(name = "Repo::init")]
    pub async fn init(root: &AbsDirPath, force: bool) -> Result<Self> {
        let meta = root.try_join_dir(REPO_DIR)?;
        if fs::is_dir(meta.as_std_path()).await {
            if !force {
                bail!("'{root}' is already initialized; use --force to reinitialize");
            }
            fs::remove_dir_all(&meta).await?;
        }

        fs::create_dir_all(&meta).await?;
        Config::default().save(&meta.try_join_file("config")?).await?;
        // The cache and tmp trees are machine-local; config is shared.
        fs::write(&meta.try_join_file(".gitignore")?, b"/cache\n/tmp\n").await?;

        Self::open(root).await
    }

    /// Take the repo-wide advisory lock, failing fast if another process
    /// holds it.
    pub async fn lock(&self) -> Result<LockFile<Locked>> {
        let path = self.tmp_dir()?.try_join_file("lock")?;
        LockFile::open(path).await?.try_lock().await
    }

    pub fn root(&self) -> &AbsDirPath {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn odb(&self) -> &Odb {
        &self.odb
    }

    pub fn run_cache(&self) -> &RunCache {
        &self.run_cache
    }

    pub fn state(&self) -> &StateIndex {
        &self.state
    }

    pub fn ignore(&self) -> &IgnoreRules {
        &self.ignore
    }

    pub fn linker(&self) -> &Linker {
        &self.linker
    }

    pub fn scm(&self) -> &dyn Scm {
        self.scm.as_ref()
    }

    fn meta_dir(&self) -> Result<AbsDirPath> {
        self.root.try_join_dir(REPO_DIR)
    }

    fn tmp_dir(&self) -> Result<AbsDirPath> {
        self.meta_dir()?.try_join_dir("tmp")
    }

    /// Resolve a remote by name, falling back to the configured default.
    ///
    /// `Ok(None)` means no remote is configured at all; asking for a named
    /// remote that is not declared is an error.
    pub fn remote(&self, name: Option<&str>) -> Result<Option<Remote<FsRemote>>> {
        let name = match name.or(self.config.core.remote.as_deref()) {
            Some(name) => name.to_string(),
            None => return Ok(None),
        };
        let declared = self
            .config
            .remote
            .get(&name)
            .ok_or_else(|| eyre!("remote '{name}' is not configured"))?;

        let url = std::path::Path::new(&declared.url);
        let store_root = if url.is_absolute() {
            AbsDirPath::try_from(url)?
        } else {
            self.root.try_join_dir(&declared.url)?
        };

        let index_path = self
            .tmp_dir()?
            .try_join_dir("index")?
            .try_join_file(format!("{name}.db"))?;
        let index = RemoteIndex::open(index_path.as_std_path())?;

        Ok(Some(Remote {
            store: FsRemote::new(name, store_root),
            index,
        }))
    }
}
