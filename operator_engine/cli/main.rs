//! Operator command-line interface

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use operator_engine::audit::{
    AuditEventType, AuditRecord, AuditTracker, fingerprint, new_session_id,
};
use operator_engine::collaborators::{
    DepositDataSource, FileDepositDataSource, InMemoryRegistry, InMemoryStatuses,
};
use operator_engine::config::EngineSettings;
use operator_engine::deposit::{generate_merkle_deposit_datum, verify_deposit_datum};
use operator_engine::derivation::{
    Mnemonic, confirm_mnemonic, derive, derive_keypairs, find_index, generate_new_mnemonic,
    public_key_of,
};
use operator_engine::error::EngineError;
use operator_engine::logging::init_logging;
use operator_engine::reconcile::{Collaborators, ReconciliationEngine};
use operator_engine::shares::{
    Committee, RecipientSecret, aggregate_shard_public_key, decrypt_envelope, parse_share_filename,
    shard_public_keys, split_for_committee, verify_committee_file, verify_shard_public_keys,
    write_committee_shares,
};
use operator_engine::store::{
    DatabaseKeyRecord, KeystorePersistence, LocalKeystoreStore, MemoryKeystoreStore,
    parse_decryption_key, public_keys_for_validator, validators_count, write_validator_keys,
};
use operator_engine::types::{Bytes32, MerkleDepositData, PublicKey};

#[derive(Parser)]
#[command(name = "operator", version, about = "Staking operator key toolchain")]
struct Cli {
    /// TOML settings file; environment variables override it
    #[arg(long, env = "OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Write the log file as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new 24-word mnemonic
    NewMnemonic {
        #[arg(long, default_value = "english")]
        language: String,

        /// Ask for the phrase back before finishing
        #[arg(long)]
        confirm: bool,
    },

    /// Print the public key at a derivation index
    Pubkey {
        #[arg(long, env = "OPERATOR_MNEMONIC", hide_env_values = true)]
        mnemonic: String,

        #[arg(long)]
        index: u32,
    },

    /// Find the derivation index of a public key
    PubkeyIndex {
        #[arg(long, env = "OPERATOR_MNEMONIC", hide_env_values = true)]
        mnemonic: String,

        #[arg(long)]
        public_key: String,

        #[arg(long, default_value_t = 10_000)]
        limit: u32,
    },

    /// Sign deposit data for a range of keys and write it with Merkle proofs
    CreateDepositData {
        #[arg(long, env = "OPERATOR_MNEMONIC", hide_env_values = true)]
        mnemonic: String,

        #[arg(long)]
        count: u32,

        #[arg(long, default_value_t = 0)]
        start_index: u32,

        #[arg(long, default_value = "deposit_data.json")]
        output: PathBuf,
    },

    /// Verify a deposit data file against the configured network
    VerifyDepositData {
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        merkle_root: Option<String>,

        #[arg(long)]
        count: Option<usize>,
    },

    /// Split the deposit data keys across a committee and write encrypted share files
    CreateCommitteeShares {
        #[arg(long, env = "OPERATOR_MNEMONIC", hide_env_values = true)]
        mnemonic: String,

        #[arg(long)]
        deposit_data: PathBuf,

        /// JSON list of shards, each a list of `ssh-rsa ... handle` lines
        #[arg(long)]
        committee: PathBuf,

        #[arg(long)]
        operator: String,

        #[arg(long)]
        allocation_id: String,

        #[arg(long, default_value_t = 0)]
        start_index: u32,

        #[arg(long, default_value = "committee")]
        output_dir: PathBuf,
    },

    /// Decrypt a share file and print the public keys of its shares
    ShardPubkeys {
        #[arg(long)]
        share_file: PathBuf,

        #[arg(long)]
        private_key: PathBuf,
    },

    /// Check that shard public keys rebuild every deposit data public key
    VerifyShardPubkeys {
        #[arg(long)]
        deposit_data: PathBuf,

        /// JSON object of zero-based shard position to public key list
        #[arg(long)]
        shards: PathBuf,
    },

    /// Check a share file against the expected aggregate public key
    VerifyOperatorShard {
        #[arg(long)]
        share_file: PathBuf,

        #[arg(long)]
        private_key: PathBuf,

        #[arg(long)]
        expected: String,
    },

    /// Reconcile keystores on the local filesystem
    SyncLocal {
        #[arg(long, env = "OPERATOR_MNEMONIC", hide_env_values = true)]
        mnemonic: String,

        #[arg(long)]
        root: PathBuf,

        /// Deposit data file name under --deposit-dir
        #[arg(long)]
        deposit_data: String,

        #[arg(long, default_value = ".")]
        deposit_dir: PathBuf,

        /// JSON list of registered public keys
        #[arg(long)]
        registrations: Option<PathBuf>,

        /// JSON object of public key to beacon status
        #[arg(long)]
        statuses: Option<PathBuf>,

        /// Print the plan without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Decrypt every local keystore and check keys and uniqueness
    VerifyLocal {
        #[arg(long)]
        root: PathBuf,
    },

    /// Decrypt a committee share file, sign with every share and verify the aggregate
    VerifyCommitteeFile {
        #[arg(long)]
        committee_file: PathBuf,

        #[arg(long)]
        private_key: PathBuf,

        /// JSON list of the public keys the shares must produce
        #[arg(long)]
        shard_pubkeys: Option<PathBuf>,
    },

    /// Reconcile keys into sealed database rows for a remote signer
    SyncDb {
        #[arg(long, env = "OPERATOR_MNEMONIC", hide_env_values = true)]
        mnemonic: String,

        /// Deposit data file name under --deposit-dir
        #[arg(long)]
        deposit_data: String,

        #[arg(long, default_value = ".")]
        deposit_dir: PathBuf,

        #[arg(long)]
        registrations: Option<PathBuf>,

        #[arg(long)]
        statuses: Option<PathBuf>,

        /// Base64 sealing key; a new one is generated when absent
        #[arg(long, env = "OPERATOR_DECRYPTION_KEY", hide_env_values = true)]
        decryption_key: Option<String>,

        #[arg(long, default_value = "keys.json")]
        output: PathBuf,
    },

    /// Write the key list and lighthouse definitions for one validator client
    SyncValidatorKeys {
        /// Rows written by sync-db
        #[arg(long)]
        records: PathBuf,

        #[arg(long)]
        index: u32,

        #[arg(long)]
        output_dir: PathBuf,

        #[arg(long, env = "WEB3SIGNER_URL")]
        web3signer_url: String,
    },
}

/// Per-invocation state shared by the commands.
struct Session {
    settings: EngineSettings,
    audit: AuditTracker,
    id: String,
}

impl Session {
    fn record(&self, event_type: AuditEventType, subject: &str, message: impl Into<String>) {
        self.audit
            .log(AuditRecord::new(event_type, self.id.clone(), message).with_subject(subject));
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging(&cli.log_dir, cli.json_logs) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let settings = match EngineSettings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let session = Session {
        settings,
        audit: AuditTracker::default(),
        id: new_session_id(),
    };
    info!(session = %session.id, network = %session.settings.network.name, "operator started");

    match run(cli.command, &session) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err, &session);
            ExitCode::FAILURE
        }
    }
}

/// Safety-critical engine errors get a banner; everything else a plain line.
fn report(err: &anyhow::Error, session: &Session) {
    let critical = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<EngineError>())
        .find(|e| e.is_safety_critical());

    if let Some(engine_err) = critical {
        session.record(AuditEventType::SafetyAlert, "keystores", engine_err.to_string());
        eprintln!();
        eprintln!("!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!");
        eprintln!("!! SAFETY CHECK FAILED: nothing was written");
        eprintln!("!! {engine_err}");
        eprintln!("!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!");
        eprintln!();
    } else {
        eprintln!("error: {err:#}");
    }
}

fn run(command: Commands, session: &Session) -> Result<()> {
    let settings = &session.settings;
    let network = &settings.network;

    match command {
        Commands::NewMnemonic { language, confirm } => {
            let mnemonic = generate_new_mnemonic(&language)?;
            println!("{}", mnemonic.phrase().as_str());
            if confirm {
                eprint!("Type the mnemonic back to confirm: ");
                io::stderr().flush()?;
                let mut typed = String::new();
                io::stdin().lock().read_line(&mut typed)?;
                if !confirm_mnemonic(&mnemonic, &typed) {
                    bail!("the typed mnemonic does not match");
                }
            }
            session.record(AuditEventType::Derive, &language, "generated new mnemonic");
        }

        Commands::Pubkey { mnemonic, index } => {
            let mnemonic = parse_mnemonic(&mnemonic)?;
            let key = derive(&mnemonic, index, settings.legacy)?;
            println!("{}", public_key_of(&key));
            session.record(AuditEventType::Derive, &key.path.to_string(), "derived public key");
        }

        Commands::PubkeyIndex {
            mnemonic,
            public_key,
            limit,
        } => {
            let mnemonic = parse_mnemonic(&mnemonic)?;
            let public_key = PublicKey::from_hex(&public_key)?;
            match find_index(&mnemonic, &public_key, settings.legacy, limit)? {
                Some(index) => println!("{index}"),
                None => bail!("{public_key} not found in the first {limit} indexes"),
            }
        }

        Commands::CreateDepositData {
            mnemonic,
            count,
            start_index,
            output,
        } => {
            let mnemonic = parse_mnemonic(&mnemonic)?;
            let end = start_index
                .checked_add(count)
                .ok_or_else(|| anyhow!("index range overflows"))?;
            let pairs = derive_keypairs(
                &mnemonic,
                &(start_index..end).collect::<Vec<_>>(),
                settings.legacy,
            )?;
            let (root, datum) = generate_merkle_deposit_datum(
                &pairs,
                &network.withdrawal_credentials,
                network.deposit_amount_gwei,
                &network.genesis_fork_version,
            )?;
            let json = serde_json::to_string_pretty(&datum)?;
            fs::write(&output, &json)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("merkle root: {root}");
            session.record(
                AuditEventType::DepositData,
                &output.display().to_string(),
                format!("signed {count} deposits, file {}", fingerprint(json.as_bytes())),
            );
        }

        Commands::VerifyDepositData {
            file,
            merkle_root,
            count,
        } => {
            let datum = read_deposit_data(&file)?;
            let expected = merkle_root.as_deref().map(Bytes32::from_hex).transpose()?;
            let report = verify_deposit_datum(
                &datum,
                &network.withdrawal_credentials,
                network.deposit_amount_gwei,
                &network.genesis_fork_version,
                expected.as_ref(),
                count,
            )?;
            println!(
                "{} deposits verified, merkle root {}",
                report.public_keys.len(),
                report.merkle_root
            );
            session.record(
                AuditEventType::Verification,
                &file.display().to_string(),
                "deposit data verified",
            );
        }

        Commands::CreateCommitteeShares {
            mnemonic,
            deposit_data,
            committee,
            operator,
            allocation_id,
            start_index,
            output_dir,
        } => {
            let mnemonic = parse_mnemonic(&mnemonic)?;
            let datum = read_deposit_data(&deposit_data)?;
            let committee = Committee::from_json_file(&committee)
                .with_context(|| format!("reading committee {}", committee.display()))?;

            let count = u32::try_from(datum.len())?;
            let end = start_index
                .checked_add(count)
                .ok_or_else(|| anyhow!("index range overflows"))?;
            let pairs = derive_keypairs(
                &mnemonic,
                &(start_index..end).collect::<Vec<_>>(),
                settings.legacy,
            )?;
            if let Some((pair, entry)) = pairs
                .iter()
                .zip(&datum)
                .find(|(pair, entry)| pair.public_key != entry.public_key)
            {
                bail!(
                    "deposit data key {} does not match derived key at index {}",
                    entry.public_key,
                    pair.index
                );
            }

            let set = split_for_committee(&committee, &pairs)?;
            let written = write_committee_shares(&set, &output_dir, &operator, &allocation_id)?;
            for (handle, path) in &written {
                println!("{handle}: {}", path.display());
            }
            session.record(
                AuditEventType::ShareSplit,
                &allocation_id,
                format!("{} keys shared with {} members", pairs.len(), written.len()),
            );
        }

        Commands::ShardPubkeys {
            share_file,
            private_key,
        } => {
            let plaintext = open_share_file(&share_file, &private_key)?;
            let keys = shard_public_keys(&plaintext)?;
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }

        Commands::VerifyShardPubkeys {
            deposit_data,
            shards,
        } => {
            let datum = read_deposit_data(&deposit_data)?;
            let raw = fs::read_to_string(&shards)
                .with_context(|| format!("reading {}", shards.display()))?;
            let shard_keys: BTreeMap<u32, Vec<PublicKey>> = serde_json::from_str(&raw)?;
            let deposit_keys: Vec<PublicKey> = datum.iter().map(|d| d.public_key).collect();
            verify_shard_public_keys(&deposit_keys, &shard_keys)?;
            println!("{} public keys reconstructed", deposit_keys.len());
            session.record(
                AuditEventType::Verification,
                &shards.display().to_string(),
                "shard public keys verified",
            );
        }

        Commands::VerifyOperatorShard {
            share_file,
            private_key,
            expected,
        } => {
            let expected = PublicKey::from_hex(&expected)?;
            let plaintext = open_share_file(&share_file, &private_key)?;
            let aggregate = aggregate_shard_public_key(&plaintext)?;
            if aggregate != expected {
                bail!("share file aggregates to {aggregate}, expected {expected}");
            }
            println!("share file matches {expected}");
            session.record(
                AuditEventType::Verification,
                &share_file.display().to_string(),
                "operator shard verified",
            );
        }

        Commands::SyncLocal {
            mnemonic,
            root,
            deposit_data,
            deposit_dir,
            registrations,
            statuses,
            dry_run,
        } => {
            let mnemonic = parse_mnemonic(&mnemonic)?;
            let datum = FileDepositDataSource::new(deposit_dir).fetch(&deposit_data)?;
            let registry = match registrations {
                Some(path) => InMemoryRegistry::from_json_file(&path)?,
                None => InMemoryRegistry::default(),
            };
            let statuses = match statuses {
                Some(path) => InMemoryStatuses::from_json_file(&path)?,
                None => InMemoryStatuses::default(),
            };

            let store = LocalKeystoreStore::new(&root, settings.legacy)
                .with_kdf_log_n(settings.keystore_kdf_log_n);
            let engine = ReconciliationEngine::new(settings.reconcile_settings());
            let outcome = engine.run(
                &mnemonic,
                &store,
                &Collaborators {
                    registrations: &registry,
                    statuses: &statuses,
                },
                &datum,
            )?;
            println!("{}", serde_json::to_string_pretty(&outcome.plan)?);

            if dry_run {
                info!("dry run, nothing written");
                return Ok(());
            }
            engine.apply(&store, &outcome)?;
            session.record(
                AuditEventType::Reconcile,
                &root.display().to_string(),
                format!(
                    "added {} removed {} keystores",
                    outcome.plan.additions.len(),
                    outcome.plan.removals.len()
                ),
            );
        }

        Commands::VerifyLocal { root } => {
            let store = LocalKeystoreStore::new(&root, settings.legacy);
            let count = store.verify()?;
            let containers = store
                .list_current()?
                .iter()
                .map(|r| r.container.clone())
                .collect::<BTreeSet<_>>()
                .len();
            println!("{count} keystores verified in {containers} containers");
            session.record(
                AuditEventType::Verification,
                &root.display().to_string(),
                "local keystores verified",
            );
        }

        Commands::VerifyCommitteeFile {
            committee_file,
            private_key,
            shard_pubkeys,
        } => {
            let pem = fs::read_to_string(&private_key)
                .with_context(|| format!("reading {}", private_key.display()))?;
            let secret = RecipientSecret::parse_pem(&pem)?;
            let expected: Option<Vec<PublicKey>> = match shard_pubkeys {
                Some(path) => {
                    let raw = fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    Some(serde_json::from_str(&raw)?)
                }
                None => None,
            };
            let proof = verify_committee_file(&committee_file, &secret, expected.as_deref())?;
            println!("{}", proof.aggregate_signature);
            session.record(
                AuditEventType::Verification,
                &committee_file.display().to_string(),
                format!("committee file verified, {} shares", proof.public_keys.len()),
            );
        }

        Commands::SyncDb {
            mnemonic,
            deposit_data,
            deposit_dir,
            registrations,
            statuses,
            decryption_key,
            output,
        } => {
            let mnemonic = parse_mnemonic(&mnemonic)?;
            let datum = FileDepositDataSource::new(deposit_dir).fetch(&deposit_data)?;
            let registry = match registrations {
                Some(path) => InMemoryRegistry::from_json_file(&path)?,
                None => InMemoryRegistry::default(),
            };
            let statuses = match statuses {
                Some(path) => InMemoryStatuses::from_json_file(&path)?,
                None => InMemoryStatuses::default(),
            };

            let store = match decryption_key {
                Some(key) => {
                    MemoryKeystoreStore::with_key(settings.legacy, parse_decryption_key(&key)?)
                }
                None => MemoryKeystoreStore::new(settings.legacy),
            };
            let engine = ReconciliationEngine::new(settings.reconcile_settings());
            let outcome = engine.run(
                &mnemonic,
                &store,
                &Collaborators {
                    registrations: &registry,
                    statuses: &statuses,
                },
                &datum,
            )?;
            engine.apply(&store, &outcome)?;

            let records = store.export_database_records()?;
            fs::write(&output, serde_json::to_string_pretty(&records)?)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("DECRYPTION_KEY={}", store.decryption_key().as_str());
            println!("validators: {}", validators_count(&records));
            session.record(
                AuditEventType::Reconcile,
                &output.display().to_string(),
                format!("exported {} sealed keys", records.len()),
            );
        }

        Commands::SyncValidatorKeys {
            records,
            index,
            output_dir,
            web3signer_url,
        } => {
            let raw = fs::read_to_string(&records)
                .with_context(|| format!("reading {}", records.display()))?;
            let rows: Vec<DatabaseKeyRecord> = serde_json::from_str(&raw)?;
            let keys = public_keys_for_validator(&rows, index);
            if write_validator_keys(&output_dir, &keys, &web3signer_url)? {
                println!("{} keys written to {}", keys.len(), output_dir.display());
            } else {
                println!("keys did not change, skipping update");
            }
            session.record(
                AuditEventType::Reconcile,
                &format!("validator{index}"),
                format!("{} validator keys synced", keys.len()),
            );
        }
    }
    Ok(())
}

fn parse_mnemonic(phrase: &str) -> Result<Mnemonic> {
    Mnemonic::parse(phrase).context("mnemonic rejected")
}

fn read_deposit_data(path: &Path) -> Result<Vec<MerkleDepositData>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn open_share_file(share_file: &Path, private_key: &Path) -> Result<String> {
    let meta = parse_share_filename(&share_file.to_string_lossy())?;
    info!(member = %meta.member_handle, allocation = %meta.allocation_name, "opening share file");

    let pem = fs::read_to_string(private_key)
        .with_context(|| format!("reading {}", private_key.display()))?;
    let secret = RecipientSecret::parse_pem(&pem)?;
    let bytes = fs::read(share_file).with_context(|| format!("reading {}", share_file.display()))?;
    let plaintext = decrypt_envelope(&secret, &bytes)?;
    String::from_utf8(plaintext.to_vec()).context("share file is not UTF-8")
}
