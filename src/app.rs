//! Process boot: configuration, secrets, ledger, gate, then the Runner.
use crate::audit::{Qc, StageCompare};
use crate::cli::{CommonArgs, GateArgs, RootArgs, SubCommand};
use crate::config::{load_config, ModuleKind, ProcessorConfig, SystemStatusMode};
use crate::errors::ProcessorError;
use crate::gate::{Gate, GateCheck, GateProbe, GateScope};
use crate::ledger::{Database, Ledger, TableNames, WriteMode};
use crate::module::{Command, ModuleContext, ProcessingModule, StagerModule};
use crate::runner::{Runner, RunnerSettings};
use crate::secrets::{required, resolve_database, DatabaseLocation, FileSecretStore, SecretStore};
use crate::streams::Streams;
use crate::summarizer::Summarizer;
use crate::upstream::{OrthancClient, UpstreamStore};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Exit code for anything that fails before the first iteration.
pub const BOOT_FAILURE: i32 = -1;

const MODULE_KINDS: [ModuleKind; 2] = [ModuleKind::Onprem, ModuleKind::Cloud];

pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    // A second init (tests, repeated boots) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parse-free entry point used by `main`.
pub fn run(args: RootArgs) -> i32 {
    let (common, gate_mode) = match args.command {
        SubCommand::Run(run) => (run.common, None),
        SubCommand::Gate(GateArgs { common, write, .. }) => {
            let mode = if write {
                SystemStatusMode::Write
            } else {
                SystemStatusMode::Read
            };
            (common, Some(mode))
        }
    };
    let mut config = match load_config(&common.config) {
        Ok(config) => config,
        Err(err) => {
            init_tracing(common.verbose);
            tracing::error!(error = %format!("{err:#}"), "configuration rejected");
            return BOOT_FAILURE;
        }
    };
    init_tracing(common.verbose || config.global.verbose);
    if let Some(mode) = gate_mode {
        config.global.system_status_run_mode = mode;
    }

    let streams = Streams::stdout();
    let engine = Engine::new(config, Box::new(secret_store(&common)), streams.clone());
    let code = match engine.execute() {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "FATAL ERROR: boot failed");
            BOOT_FAILURE
        }
    };
    streams.flush();
    code
}

fn secret_store(common: &CommonArgs) -> FileSecretStore {
    FileSecretStore::new(&common.secrets_dir)
}

fn local_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// A booted engine owns the effective configuration and its secret store.
pub struct Engine {
    config: ProcessorConfig,
    secrets: Box<dyn SecretStore>,
    streams: Streams,
}

impl Engine {
    pub fn new(config: ProcessorConfig, secrets: Box<dyn SecretStore>, streams: Streams) -> Self {
        Self {
            config,
            secrets,
            streams,
        }
    }

    fn emit_config(&self) {
        self.streams.cfg_header();
        self.config
            .visit(|source, key, value| self.streams.cfg(source.as_str(), key, value));
    }

    /// Module kinds some enabled module or command will touch.
    fn kinds_in_use(&self) -> Vec<ModuleKind> {
        let config = &self.config;
        MODULE_KINDS
            .into_iter()
            .filter(|kind| {
                config.stager(*kind).process
                    || (config.summarizer.process && config.summarizer.module == *kind)
                    || (config.stage_compare.process && config.stage_compare.module == *kind)
                    || (config.qc.process && config.qc.module == *kind)
            })
            .collect()
    }

    fn gate_scopes(&self, kinds: &[ModuleKind]) -> Vec<GateScope> {
        let node = match self.config.global.node_name.trim() {
            "" => local_node_name(),
            name => name.to_string(),
        };
        let mut scopes = vec![GateScope::Overall, GateScope::PerNode(node)];
        scopes.extend(
            kinds
                .iter()
                .map(|kind| GateScope::PerModule(kind.as_str().to_string())),
        );
        scopes
    }

    /// Read or write one gate row, then stop.
    fn system_status(&self, gate: &Gate, mode: WriteMode) -> Result<i32> {
        let global = &self.config.global;
        let scope = GateScope::parse(&global.system_status_type, &global.system_status_node)?;
        match global.system_status_run_mode {
            SystemStatusMode::Write => {
                gate.write(
                    &scope,
                    global.system_status_active,
                    &global.system_status_desc,
                    mode,
                    &self.streams,
                )?;
            }
            SystemStatusMode::Read | SystemStatusMode::None => {}
        }
        let active = gate.is_active(&scope)?;
        self.streams
            .cfg("system_status", &scope.to_string(), &active.to_string());
        Ok(0)
    }

    fn module_context(
        &self,
        kind: ModuleKind,
        db: &Rc<Database>,
        location: &DatabaseLocation,
        gate: &Rc<dyn GateCheck>,
        mode: WriteMode,
    ) -> Result<ModuleContext> {
        let global = &self.config.global;
        let vault_path = self.config.stager(kind).vault_path.as_str();
        let secrets = self
            .secrets
            .read(vault_path)
            .with_context(|| format!("read {kind} secrets"))?;
        let url = required(&secrets, vault_path, "orthanc_url")?;
        let token = required(&secrets, vault_path, "orthanc_token")?;
        let stage_db = required(&secrets, vault_path, "stage_db_name")?;
        let stage_target = if stage_db == ":memory:" {
            stage_db
        } else {
            DatabaseLocation {
                host: location.host.clone(),
                name: stage_db,
            }
            .path()
            .display()
            .to_string()
        };
        db.attach_stage(kind, &stage_target)?;

        let workspace = global
            .workspaces_enable
            .then_some(global.workspace_name.as_str());
        let tables = TableNames::for_module(kind, workspace);
        self.streams.cfg("tables", &format!("{kind}_manifest"), &tables.manifest);
        self.streams.cfg("tables", &format!("{kind}_status"), &tables.status);
        let upstream: Rc<dyn UpstreamStore> = Rc::new(OrthancClient::new(&url, &token));
        let ledger = Ledger::open(Rc::clone(db), tables, self.streams.clone(), upstream)?;
        Ok(ModuleContext {
            kind,
            ledger: Rc::new(ledger),
            gate: Rc::clone(gate),
            streams: self.streams.clone(),
            mode,
            secrets,
            workspace_name: workspace.unwrap_or_default().to_string(),
        })
    }

    fn commands(&self, contexts: &BTreeMap<ModuleKind, ModuleContext>) -> Result<Vec<Box<dyn Command>>> {
        let config = &self.config;
        let mut commands: Vec<(ModuleKind, Box<dyn Command>)> = Vec::new();
        if config.summarizer.process {
            commands.push((
                config.summarizer.module,
                Box::new(Summarizer::new(
                    config.summarizer.clone(),
                    config
                        .stager(config.summarizer.module)
                        .force_reprocess_accession_status,
                )),
            ));
        }
        if config.stage_compare.process {
            commands.push((
                config.stage_compare.module,
                Box::new(StageCompare::new(config.stage_compare.clone())),
            ));
        }
        if config.qc.process {
            commands.push((config.qc.module, Box::new(Qc::new(config.qc.clone()))));
        }
        commands
            .into_iter()
            .map(|(kind, mut command)| -> Result<Box<dyn Command>> {
                let ctx = contexts
                    .get(&kind)
                    .cloned()
                    .with_context(|| format!("no ledger bound for {kind}"))?;
                command
                    .setup(ctx)
                    .with_context(|| format!("set up {}", command.name()))?;
                Ok(command)
            })
            .collect()
    }

    fn modules(
        &self,
        contexts: &BTreeMap<ModuleKind, ModuleContext>,
    ) -> Result<Vec<Box<dyn ProcessingModule>>> {
        let mut modules: Vec<Box<dyn ProcessingModule>> = Vec::new();
        for kind in MODULE_KINDS {
            let stager = self.config.stager(kind);
            if !stager.process {
                continue;
            }
            let ctx = contexts
                .get(&kind)
                .cloned()
                .with_context(|| format!("no ledger bound for {kind}"))?;
            let mut module = StagerModule::new(kind, stager.clone());
            module.setup(ctx).with_context(|| format!("set up {kind}"))?;
            modules.push(Box::new(module));
        }
        Ok(modules)
    }

    /// Boot and run to completion, returning the process exit code.
    pub fn execute(self) -> Result<i32> {
        self.emit_config();
        let global = &self.config.global;
        let mode = WriteMode::from_dry_run(self.config.dry_run());
        if mode.is_dry_run() {
            tracing::warn!("enable_db_updates is off; ledger changes are printed, not applied");
        }

        let location = resolve_database(self.secrets.as_ref(), &global.db_vault_path)?;
        self.streams
            .cfg("secret", "db_path", &location.path().display().to_string());
        let db = Rc::new(Database::open(&location.path())?);
        let gate = Rc::new(Gate::open(Rc::clone(&db))?);

        if global.system_status_run_mode != SystemStatusMode::None {
            return self.system_status(&gate, mode);
        }

        let kinds = self.kinds_in_use();
        if kinds.is_empty() {
            return Err(ProcessorError::Config(
                "no processing module or command is enabled".to_string(),
            )
            .into());
        }
        let probe = GateProbe::new(Rc::clone(&gate), self.gate_scopes(&kinds));
        for (scope, active) in probe.report()? {
            self.streams
                .cfg("system_status", &scope.to_string(), &active.to_string());
        }
        if let Some(scope) = probe.closed_scope()? {
            tracing::error!(%scope, "FATAL ERROR: system status inactive");
            return Err(ProcessorError::Gate(scope.to_string()).into());
        }
        let probe: Rc<dyn GateCheck> = Rc::new(probe);

        let mut contexts = BTreeMap::new();
        for kind in kinds {
            let ctx = self.module_context(kind, &db, &location, &probe, mode)?;
            contexts.insert(kind, ctx);
        }
        let commands = self.commands(&contexts)?;
        let modules = self.modules(&contexts)?;

        let settings = RunnerSettings::from_config(global);
        let report = Runner::new(settings, modules, commands, probe)?.run();
        tracing::info!(
            iterations = report.iterations,
            total_errors = report.total_errors,
            total_processed = report.total_processed,
            termination = ?report.termination,
            "run finished"
        );
        self.streams.flush();
        Ok(report.exit_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::secrets::StaticSecretStore;
    use crate::streams::{CFG_OUT, MANIFEST_OUTPUT};
    use std::io::Write;

    struct Site {
        dir: tempfile::TempDir,
        secrets: StaticSecretStore,
    }

    impl Site {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut secrets = StaticSecretStore::default();
            let host = dir.path().display().to_string();
            secrets.insert("db", "DB_host", &host);
            secrets.insert("db", "DB_name", "ledger");
            secrets.insert("onprem", "orthanc_url", "http://orthanc.invalid:8042");
            secrets.insert("onprem", "orthanc_token", "token");
            secrets.insert("onprem", "stage_db_name", "stage_onprem");
            secrets.insert("onprem", "target_root", &host);
            Self { dir, secrets }
        }

        fn manifest(&self, lines: &[&str]) -> String {
            let path = self.dir.path().join("input.csv");
            let mut file = std::fs::File::create(&path).expect("manifest");
            for line in lines {
                writeln!(file, "{line}").expect("write");
            }
            path.display().to_string()
        }

        fn execute(&self, config: &str) -> (Result<i32>, Streams) {
            let config = load_config_from_str(config, |_| None).expect("config");
            let streams = Streams::capture();
            let engine = Engine::new(config, Box::new(self.secrets.clone()), streams.clone());
            (engine.execute(), streams)
        }
    }

    #[test]
    fn gate_write_then_read_round_trips_through_the_ledger() {
        let site = Site::new();
        let write = r#"{
            "db_vault_path": "db",
            "enable_db_updates": true,
            "system_status_run_mode": "write",
            "system_status_type": "per-node",
            "system_status_node": "worker-3",
            "system_status_desc": "disk swap",
            "system_status_active": false
        }"#;
        let (code, streams) = site.execute(write);
        assert_eq!(code.expect("write"), 0);
        assert!(streams
            .lines()
            .contains(&format!("{CFG_OUT},system_status,per-node/worker-3,false")));

        let read = write.replace("\"write\"", "\"read\"");
        let (code, streams) = site.execute(&read);
        assert_eq!(code.expect("read"), 0);
        assert!(streams
            .lines()
            .contains(&format!("{CFG_OUT},system_status,per-node/worker-3,false")));
    }

    #[test]
    fn closed_gate_stops_boot() {
        let site = Site::new();
        let close = r#"{
            "db_vault_path": "db",
            "enable_db_updates": true,
            "system_status_run_mode": "write",
            "system_status_type": "per-module",
            "system_status_node": "onprem",
            "system_status_active": false
        }"#;
        site.execute(close).0.expect("close");

        let manifest = site.manifest(&["ACCESSION_NUM", "A1"]);
        let run = format!(
            r#"{{"db_vault_path": "db", "onprem_vault_path": "onprem",
                "summarizer_process": true, "summarizer_manifest_path": {manifest:?}}}"#
        );
        let (code, streams) = site.execute(&run);
        let err = code.expect_err("gate closed");
        assert!(err.to_string().contains("per-module/onprem"));
        assert!(streams.lines_of(MANIFEST_OUTPUT).is_empty());
    }

    #[test]
    fn nothing_enabled_is_a_boot_failure() {
        let site = Site::new();
        let (code, streams) = site.execute(r#"{"db_vault_path": "db"}"#);
        assert!(code.is_err());
        assert_eq!(streams.lines()[0], format!("{CFG_OUT},KEY_TYPE,KEY,VALUE"));
    }

    #[test]
    fn summarizer_run_reports_against_a_fresh_ledger() {
        let site = Site::new();
        let manifest = site.manifest(&["ACCESSION_NUM", "A1", "A2"]);
        let run = format!(
            r#"{{"db_vault_path": "db", "onprem_vault_path": "onprem",
                "summarizer_process": true, "summarizer_manifest_path": {manifest:?},
                "summarizer_preload_enable": true}}"#
        );
        let (code, streams) = site.execute(&run);

        assert_eq!(code.expect("run"), 0);
        let output = streams.lines_of(MANIFEST_OUTPUT);
        assert!(output
            .iter()
            .any(|line| line.starts_with("MANIFEST_OUTPUT:,A1,,DRYRUN:ZZZ-ONDECK-PENDING_CHANGE:preload,")));
        assert!(streams
            .lines()
            .contains(&format!("{CFG_OUT},tables,onprem_manifest,onprem_manifest")));
        assert!(site.dir.path().join("ledger.sqlite3").exists());
    }

    #[test]
    fn missing_module_secret_is_reported() {
        let mut site = Site::new();
        site.secrets = {
            let mut secrets = StaticSecretStore::default();
            let host = site.dir.path().display().to_string();
            secrets.insert("db", "DB_host", &host);
            secrets.insert("db", "DB_name", "ledger");
            secrets.insert("onprem", "orthanc_url", "http://orthanc.invalid:8042");
            secrets
        };
        let manifest = site.manifest(&["ACCESSION_NUM", "A1"]);
        let run = format!(
            r#"{{"db_vault_path": "db", "onprem_vault_path": "onprem",
                "qc_process": true, "summarizer_manifest_path": {manifest:?}}}"#
        );
        let err = site.execute(&run).0.expect_err("missing token");
        assert!(format!("{err:#}").contains("orthanc_token"));
    }
}
