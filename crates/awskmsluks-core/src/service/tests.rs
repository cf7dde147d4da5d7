use super::*;
use crate::authority::SecretPair;
use crate::key::EncryptionContext;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Mutex;
use tempfile::{tempdir, TempDir};

const ARN: &str = "arn:aws:kms:us-east-1:111122223333:key/abcd";

#[derive(Clone)]
struct StubAuthority {
    plaintext: String,
    wrapped: String,
    bound: Arc<Mutex<HashMap<String, EncryptionContext>>>,
    decrypts: Arc<Mutex<usize>>,
}

impl StubAuthority {
    fn new(plaintext: &str, wrapped: &str) -> Self {
        Self {
            plaintext: plaintext.to_string(),
            wrapped: wrapped.to_string(),
            bound: Arc::new(Mutex::new(HashMap::new())),
            decrypts: Arc::new(Mutex::new(0)),
        }
    }

    fn decrypt_calls(&self) -> usize {
        *self.decrypts.lock().unwrap()
    }
}

impl KeyAuthority for StubAuthority {
    type Error = KmsLuksError;

    fn generate_data_key(
        &self,
        _key_arn: &str,
        context: &EncryptionContext,
    ) -> KmsLuksResult<SecretPair> {
        self.bound
            .lock()
            .unwrap()
            .insert(context.uuid.clone(), context.clone());
        Ok(SecretPair {
            plaintext: Passphrase::new(self.plaintext.clone()),
            wrapped: self.wrapped.clone(),
        })
    }

    fn decrypt_data_key(
        &self,
        wrapped: &str,
        context: &EncryptionContext,
        _key_arn: &str,
    ) -> KmsLuksResult<Passphrase> {
        *self.decrypts.lock().unwrap() += 1;
        let bound = self.bound.lock().unwrap();
        if wrapped != self.wrapped || bound.get(&context.uuid) != Some(context) {
            return Err(KmsLuksError::Authority("InvalidCiphertextException".into()));
        }
        Ok(Passphrase::new(self.plaintext.clone()))
    }
}

#[derive(Clone, Default)]
struct MemoryArchive {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail: bool,
}

impl KeyArchive for MemoryArchive {
    type Error = KmsLuksError;

    fn put_object(&self, object_key: &str, body: &[u8]) -> KmsLuksResult<()> {
        if self.fail {
            return Err(KmsLuksError::Store("AccessDenied".into()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(object_key.to_string(), body.to_vec());
        Ok(())
    }

    fn get_object(&self, object_key: &str) -> KmsLuksResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(object_key)
            .cloned()
            .ok_or_else(|| KmsLuksError::Store("NoSuchKey".into()))
    }

    fn describe(&self) -> String {
        "s3://bucket".into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ToolCall {
    Format { device: PathBuf, stdin: String },
    SetUuid { device: PathBuf, uuid: String },
    Open { device: PathBuf, name: String, stdin: String },
}

#[derive(Clone, Default)]
struct RecordingTool {
    calls: Arc<Mutex<Vec<ToolCall>>>,
    fail_format: bool,
    fail_set_uuid: bool,
    fail_open: HashSet<String>,
    unresolvable: HashSet<String>,
}

impl RecordingTool {
    fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl LuksTool for RecordingTool {
    type Error = KmsLuksError;

    fn resolve_device(&self, uuid: &str) -> KmsLuksResult<PathBuf> {
        if self.unresolvable.contains(uuid) {
            return Err(KmsLuksError::Tool(format!("no device with UUID {uuid}")));
        }
        Ok(PathBuf::from(format!("/dev/disk-{uuid}")))
    }

    fn format_device(&self, device: &Path, passphrase: &Passphrase) -> KmsLuksResult<()> {
        self.calls.lock().unwrap().push(ToolCall::Format {
            device: device.to_path_buf(),
            stdin: passphrase.as_str().to_string(),
        });
        if self.fail_format {
            return Err(KmsLuksError::Tool("luksFormat exited with code 1".into()));
        }
        Ok(())
    }

    fn set_device_uuid(&self, device: &Path, uuid: &str) -> KmsLuksResult<()> {
        self.calls.lock().unwrap().push(ToolCall::SetUuid {
            device: device.to_path_buf(),
            uuid: uuid.to_string(),
        });
        if self.fail_set_uuid {
            return Err(KmsLuksError::Tool("luksUUID exited with code 1".into()));
        }
        Ok(())
    }

    fn open_device(&self, device: &Path, name: &str, passphrase: &Passphrase) -> KmsLuksResult<()> {
        self.calls.lock().unwrap().push(ToolCall::Open {
            device: device.to_path_buf(),
            name: name.to_string(),
            stdin: passphrase.as_str().to_string(),
        });
        if self.fail_open.iter().any(|uuid| device.ends_with(format!("disk-{uuid}"))) {
            return Err(KmsLuksError::Tool("No key available with this passphrase".into()));
        }
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    keys: PathBuf,
    authority: StubAuthority,
    archive: MemoryArchive,
    tool: RecordingTool,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let keys = dir.path().join("keys");
        Self {
            _dir: dir,
            keys,
            authority: StubAuthority::new("P", "C"),
            archive: MemoryArchive::default(),
            tool: RecordingTool::default(),
        }
    }

    fn config(&self) -> KmsLuksConfig {
        KmsLuksConfig {
            cmk_arn: ARN.into(),
            production: false,
            key_archive_bucket: "bucket".into(),
            key_store: self.keys.to_string_lossy().into_owned(),
            cryptsetup_path: None,
            timeout_secs: 5,
            path: PathBuf::from("/etc/awskmsluks/config.json"),
        }
    }

    fn service(&self) -> KmsLuksService<StubAuthority, MemoryArchive, RecordingTool> {
        self.service_with(self.config())
    }

    fn service_with(
        &self,
        config: KmsLuksConfig,
    ) -> KmsLuksService<StubAuthority, MemoryArchive, RecordingTool> {
        KmsLuksService::new(
            Arc::new(config),
            "host1",
            self.authority.clone(),
            self.archive.clone(),
            self.tool.clone(),
        )
    }
}

#[test]
fn encrypt_scenario_persists_redacted_key_and_feeds_passphrase() -> KmsLuksResult<()> {
    let harness = Harness::new();
    let report = harness.service().encrypt(Path::new("/dev/sdb1"))?;

    assert_eq!(report.device, PathBuf::from("/dev/sdb1"));
    assert_eq!(
        report.key_path,
        harness.keys.join("host1").join(format!("{}.json", report.uuid))
    );

    let local = fs::read_to_string(&report.key_path)?;
    assert!(local.contains("\"Encrypted\": \"C\""));
    assert!(!local.contains("Plain"));

    let objects = harness.archive.objects.lock().unwrap();
    let archived = objects
        .get(&format!("host1/{}.json", report.uuid))
        .expect("archived copy");
    assert_eq!(archived.as_slice(), local.as_bytes());
    drop(objects);

    assert_eq!(
        harness.tool.calls(),
        vec![
            ToolCall::Format {
                device: PathBuf::from("/dev/sdb1"),
                stdin: "P".into(),
            },
            ToolCall::SetUuid {
                device: PathBuf::from("/dev/sdb1"),
                uuid: report.uuid.clone(),
            },
        ]
    );
    Ok(())
}

#[test]
fn failed_format_never_binds_uuid() {
    let mut harness = Harness::new();
    harness.tool.fail_format = true;

    let err = harness
        .service()
        .encrypt(Path::new("/dev/sdb1"))
        .unwrap_err();
    assert!(matches!(err, KmsLuksError::Format { .. }), "{err:?}");

    let calls = harness.tool.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(calls[0], ToolCall::Format { .. }));
}

#[test]
fn failed_uuid_binding_is_reported_separately() {
    let mut harness = Harness::new();
    harness.tool.fail_set_uuid = true;

    let err = harness
        .service()
        .encrypt(Path::new("/dev/sdb1"))
        .unwrap_err();
    match &err {
        KmsLuksError::UuidBinding { device, uuid, .. } => {
            assert_eq!(device, &PathBuf::from("/dev/sdb1"));
            assert!(err
                .to_string()
                .contains(&format!("cryptsetup luksUUID /dev/sdb1 --uuid {uuid}")));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(harness.tool.calls().len(), 2);
}

#[test]
fn store_failure_stops_before_touching_the_device() {
    let mut harness = Harness::new();
    harness.archive.fail = true;

    let err = harness
        .service()
        .encrypt(Path::new("/dev/sdb1"))
        .unwrap_err();
    assert!(matches!(err, KmsLuksError::Store(_)));
    assert!(harness.tool.calls().is_empty());
    assert!(!harness.keys.join("host1").exists());
}

#[test]
fn malformed_arn_is_rejected_before_any_remote_call() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.cmk_arn = "arn:aws:kms:us-east-1".into();

    let err = harness
        .service_with(config)
        .encrypt(Path::new("/dev/sdb1"))
        .unwrap_err();
    assert!(matches!(err, KmsLuksError::InvalidArn { .. }));
    assert!(harness.authority.bound.lock().unwrap().is_empty());
    assert!(harness.archive.objects.lock().unwrap().is_empty());
    assert!(harness.tool.calls().is_empty());
}

#[test]
fn generated_key_round_trips_through_the_cache() -> KmsLuksResult<()> {
    let harness = Harness::new();
    let service = harness.service();
    let report = service.encrypt(Path::new("/dev/sdb1"))?;

    let passphrase = service.passphrase(&report.uuid)?;
    assert_eq!(passphrase.as_str(), "P");
    Ok(())
}

#[test]
fn unwrap_fails_when_any_context_field_differs() -> KmsLuksResult<()> {
    let harness = Harness::new();
    let service = harness.service();
    let (created, _) = service.create_key()?;
    let uuid = created.uuid().to_string();

    let tampered: [fn(&mut EncryptionContext); 3] = [
        |ctx| ctx.fqdn = "host2".into(),
        |ctx| ctx.production = !ctx.production,
        |ctx| ctx.uuid = "00000000-0000-0000-0000-000000000000".into(),
    ];
    for tamper in tampered {
        let mut record = service.cache().load("host1", &uuid)?;
        tamper(&mut record.encryption_context);
        let err = record.decrypt(&harness.authority).unwrap_err();
        assert!(matches!(err, KmsLuksError::Authority(_)));
        assert!(!record.is_unwrapped());
    }

    let mut untouched = service.cache().load("host1", &uuid)?;
    untouched.decrypt(&harness.authority)?;
    assert_eq!(untouched.passphrase().map(Passphrase::as_str), Some("P"));
    Ok(())
}

#[test]
fn passphrase_lookup_reports_missing_and_corrupt_records() {
    let harness = Harness::new();
    let service = harness.service();

    assert!(matches!(
        service.passphrase("absent"),
        Err(KmsLuksError::KeyNotFound { .. })
    ));

    fs::create_dir_all(harness.keys.join("host1")).unwrap();
    fs::write(harness.keys.join("host1/corrupt.json"), b"{\"CMKARN\":").unwrap();
    assert!(matches!(
        service.passphrase("corrupt"),
        Err(KmsLuksError::KeyParse { .. })
    ));
}

#[test]
fn unlock_resolves_unwraps_and_opens() -> KmsLuksResult<()> {
    let harness = Harness::new();
    let service = harness.service();
    let (created, _) = service.create_key()?;
    let uuid = created.uuid().to_string();
    drop(created);

    let name = service.unlock_uuid(&uuid)?;
    assert_eq!(name, format!("disk-{uuid}_crypt"));
    assert_eq!(harness.authority.decrypt_calls(), 1);
    assert_eq!(
        harness.tool.calls(),
        vec![ToolCall::Open {
            device: PathBuf::from(format!("/dev/disk-{uuid}")),
            name,
            stdin: "P".into(),
        }]
    );
    Ok(())
}

#[test]
fn unlock_skips_unwrap_for_an_unwrapped_key() -> KmsLuksResult<()> {
    let harness = Harness::new();
    let service = harness.service();
    let (created, _) = service.create_key()?;
    assert!(created.is_unwrapped());

    service.unlock(created)?;
    assert_eq!(harness.authority.decrypt_calls(), 0);
    Ok(())
}

#[test]
fn unlock_all_reports_every_record_including_corrupt_ones() -> KmsLuksResult<()> {
    let harness = Harness::new();
    let service = harness.service();
    let (first, _) = service.create_key()?;
    let (second, _) = service.create_key()?;
    let first = first.uuid().to_string();
    let second = second.uuid().to_string();
    fs::write(harness.keys.join("host1/corrupt.json"), b"not json")?;

    let outcomes = service.unlock_all()?;
    assert_eq!(outcomes.len(), 3);

    let by_uuid: HashMap<&str, &UnlockOutcome> =
        outcomes.iter().map(|o| (o.uuid.as_str(), o)).collect();
    assert!(by_uuid[first.as_str()].result.is_ok());
    assert!(by_uuid[second.as_str()].result.is_ok());
    assert!(matches!(
        by_uuid["corrupt"].result,
        Err(KmsLuksError::KeyParse { .. })
    ));
    Ok(())
}

#[test]
fn unlock_all_continues_past_device_failures() -> KmsLuksResult<()> {
    let mut harness = Harness::new();
    let seed = harness.service();
    let uuids: Vec<String> = (0..3)
        .map(|_| seed.create_key().map(|(record, _)| record.uuid().to_string()))
        .collect::<KmsLuksResult<_>>()?;

    harness.tool.unresolvable.insert(uuids[0].clone());
    harness.tool.fail_open.insert(uuids[1].clone());
    let outcomes = harness.service().unlock_all()?;

    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        if outcome.uuid == uuids[2] {
            assert!(outcome.result.is_ok());
        } else {
            match &outcome.result {
                Err(KmsLuksError::Unlock { uuid, .. }) => assert_eq!(uuid, &outcome.uuid),
                other => panic!("unexpected outcome for {}: {other:?}", outcome.uuid),
            }
        }
    }

    let opens = harness
        .tool
        .calls()
        .into_iter()
        .filter(|call| matches!(call, ToolCall::Open { .. }))
        .count();
    assert_eq!(opens, 2);
    Ok(())
}

#[test]
fn unlock_all_with_empty_cache_is_empty() -> KmsLuksResult<()> {
    let harness = Harness::new();
    assert!(harness.service().unlock_all()?.is_empty());
    Ok(())
}

#[test]
fn restore_recovers_a_lost_local_copy() -> KmsLuksResult<()> {
    let harness = Harness::new();
    let service = harness.service();
    let (created, path) = service.create_key()?;
    let uuid = created.uuid().to_string();
    fs::remove_file(&path)?;

    assert_eq!(service.restore(&uuid)?, path);
    assert_eq!(service.passphrase(&uuid)?.as_str(), "P");
    Ok(())
}

#[test]
fn unreadable_entry_is_labelled_by_its_path() {
    let unreadable = UnlockOutcome {
        uuid: String::new(),
        path: PathBuf::from("/etc/awskmsluks/keys/host1"),
        result: Err(KmsLuksError::Store("could not read entry".into())),
    };
    assert_eq!(unreadable.label(), "/etc/awskmsluks/keys/host1");

    let named = UnlockOutcome {
        uuid: "abc-123".into(),
        path: PathBuf::from("/etc/awskmsluks/keys/host1/abc-123.json"),
        result: Ok("sdb1_crypt".into()),
    };
    assert_eq!(named.label(), "abc-123");
}
