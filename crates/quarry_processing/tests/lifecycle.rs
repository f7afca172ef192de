//! End-to-end lifecycle tests: create, add files, process, publish, embargo,
//! reprocess, delete and the bundle round trip.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use quarry_files::{AccessClass, PublicUploadFiles, StagingUploadFiles};
use quarry_processing::{
    ExportTarget, NoCentralDeployment, ProcessingContext, RecordingNotifier, UploadController,
    UploadMetadataUpdate, WorkerPool,
};
use quarry_protocol::{
    generate_entry_id, MemoryUserDirectory, ProcessStatus, QuarryConfig, QuarryError, RawPath,
    UploadId, User,
};
use quarry_search::MemorySearchIndex;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(30);

struct Deployment {
    temp: TempDir,
    ctx: Arc<ProcessingContext>,
    controller: UploadController,
    pool: Option<WorkerPool>,
    search: Arc<MemorySearchIndex>,
    notifier: Arc<RecordingNotifier>,
}

impl Deployment {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(customize: impl FnOnce(&mut QuarryConfig)) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = QuarryConfig::rooted(temp.path());
        config.process.workers = 2;
        customize(&mut config);

        let search = Arc::new(MemorySearchIndex::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let users = Arc::new(MemoryUserDirectory::with_users([
            User::new("u1", "Some User"),
            User::new("u2", "Other User"),
            User::admin("admin", "Admin"),
        ]));
        let ctx = Arc::new(
            ProcessingContext::new(
                config,
                search.clone(),
                users,
                notifier.clone(),
                Arc::new(NoCentralDeployment),
            )
            .unwrap(),
        );
        let pool = WorkerPool::start(ctx.clone(), ctx.config.process.workers);
        Self {
            temp,
            controller: UploadController::new(ctx.clone()),
            ctx,
            pool: Some(pool),
            search,
            notifier,
        }
    }

    /// A zip with `a/template.json` + `a/1.aux..4.aux` and the same under `b/`.
    fn template_zip(&self) -> PathBuf {
        let path = self.temp.path().join("upload.zip");
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for dir in ["a", "b"] {
            writer
                .start_file(format!("{dir}/template.json"), options)
                .unwrap();
            writer
                .write_all(br#"{"run": {"program_name": "Template"}}"#)
                .unwrap();
            for aux in 1..=4 {
                writer
                    .start_file(format!("{dir}/{aux}.aux"), options)
                    .unwrap();
                writer.write_all(b"aux content").unwrap();
            }
        }
        writer.finish().unwrap();
        path
    }

    fn write_source(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    /// Create an upload and run the template zip through processing.
    fn processed_upload(&self) -> UploadId {
        let upload = self.controller.create("u1", None, false, None).unwrap();
        let source = self.template_zip();
        self.controller
            .add_files(&upload.upload_id, "u1", &source, RawPath::root(), false)
            .unwrap();
        let upload = self.controller.wait_for(&upload.upload_id, WAIT).unwrap();
        assert_eq!(upload.process_status, ProcessStatus::Success);
        upload.upload_id
    }

    fn public_zip_members(&self, upload_id: &UploadId, access: AccessClass) -> Vec<String> {
        let public = PublicUploadFiles::open(&self.ctx.layout, upload_id).unwrap();
        let mut zip =
            zip::ZipArchive::new(File::open(public.raw_zip_path(access)).unwrap()).unwrap();
        let mut names: Vec<String> = (0..zip.len())
            .filter_map(|index| {
                let member = zip.by_index(index).unwrap();
                (!member.is_dir()).then(|| member.name().to_string())
            })
            .collect();
        names.sort();
        names
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}

fn read_file(path: &Path) -> Vec<u8> {
    let mut bytes = Vec::new();
    File::open(path).unwrap().read_to_end(&mut bytes).unwrap();
    bytes
}

#[test]
fn test_create_add_zip_publish() {
    let deployment = Deployment::new();
    let upload_id = deployment.processed_upload();

    // Two entries with deterministically derived ids, both successful.
    let entries = deployment.controller.get_entries(&upload_id).unwrap();
    assert_eq!(entries.len(), 2);
    let expected_a = generate_entry_id(&upload_id, "a/template.json");
    let expected_b = generate_entry_id(&upload_id, "b/template.json");
    assert_eq!(entries[0].entry_id, expected_a);
    assert_eq!(entries[1].entry_id, expected_b);
    for entry in &entries {
        assert_eq!(entry.process_status, ProcessStatus::Success);
        assert_eq!(entry.parser_name, "parsers/template");
        assert!(entry.entry_hash.is_some());
    }

    deployment
        .controller
        .publish(&upload_id, "u1", Some(0))
        .unwrap();
    let upload = deployment.controller.get_upload(&upload_id).unwrap();
    assert!(upload.published());
    assert!(!upload.with_embargo());

    let public_members = deployment.public_zip_members(&upload_id, AccessClass::Public);
    assert_eq!(public_members.len(), 10);
    assert!(public_members.contains(&"a/template.json".to_string()));
    assert!(public_members.contains(&"b/4.aux".to_string()));
    assert!(deployment
        .public_zip_members(&upload_id, AccessClass::Restricted)
        .is_empty());
}

#[test]
fn test_embargoed_publish_then_lift() {
    let deployment = Deployment::new();
    let upload_id = deployment.processed_upload();

    deployment
        .controller
        .publish(&upload_id, "u1", Some(12))
        .unwrap();
    let upload = deployment.controller.get_upload(&upload_id).unwrap();
    assert!(upload.with_embargo());

    // Everything is restricted right after an embargoed publish.
    assert!(deployment
        .public_zip_members(&upload_id, AccessClass::Public)
        .is_empty());
    assert_eq!(
        deployment
            .public_zip_members(&upload_id, AccessClass::Restricted)
            .len(),
        10
    );

    deployment.controller.lift_embargo(&upload_id, "u1").unwrap();
    let upload = deployment.controller.get_upload(&upload_id).unwrap();
    assert!(!upload.with_embargo());
    assert_eq!(
        deployment
            .public_zip_members(&upload_id, AccessClass::Public)
            .len(),
        10
    );
    assert!(deployment
        .public_zip_members(&upload_id, AccessClass::Restricted)
        .is_empty());

    // A second lift violates the preconditions.
    let err = deployment
        .controller
        .lift_embargo(&upload_id, "u1")
        .unwrap_err();
    assert!(matches!(err, QuarryError::BadRequest(_)));
}

#[test]
fn test_reprocess_after_mainfile_delete() {
    let deployment = Deployment::new();
    let upload_id = deployment.processed_upload();

    deployment
        .controller
        .delete_files(
            &upload_id,
            "u1",
            RawPath::new("a/template.json").unwrap(),
        )
        .unwrap();
    let upload = deployment.controller.wait_for(&upload_id, WAIT).unwrap();
    assert_eq!(upload.process_status, ProcessStatus::Success);

    let entries = deployment.controller.get_entries(&upload_id).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].entry_id,
        generate_entry_id(&upload_id, "b/template.json")
    );

    // The search index contains exactly the surviving entry.
    let visible = deployment.search.entry_ids(&upload_id);
    assert_eq!(visible, vec![entries[0].entry_id.clone()]);
}

#[test]
fn test_parallel_add_files_race() {
    let deployment = Deployment::new();
    let upload = deployment.controller.create("u1", None, false, None).unwrap();
    let upload_id = upload.upload_id;

    let source = deployment.template_zip();
    deployment
        .controller
        .add_files(&upload_id, "u1", &source, RawPath::root(), false)
        .unwrap();

    // The second concurrent attempt loses the compare-and-set.
    let late_source = deployment.write_source("late/template.json", "{}");
    let err = deployment
        .controller
        .add_files(
            &upload_id,
            "u1",
            &late_source,
            RawPath::new("late").unwrap(),
            false,
        )
        .unwrap_err();
    assert!(matches!(err, QuarryError::ProcessAlreadyRunning));

    // Retried after the first finished, it succeeds.
    deployment.controller.wait_for(&upload_id, WAIT).unwrap();
    deployment
        .controller
        .add_files(
            &upload_id,
            "u1",
            &late_source,
            RawPath::new("late").unwrap(),
            false,
        )
        .unwrap();
    let upload = deployment.controller.wait_for(&upload_id, WAIT).unwrap();
    assert_eq!(upload.process_status, ProcessStatus::Success);
    assert_eq!(deployment.controller.get_entries(&upload_id).unwrap().len(), 3);
}

#[test]
fn test_join_runs_cleanup_exactly_once() {
    let deployment = Deployment::new();
    let upload_id = deployment.processed_upload();

    let upload = deployment.controller.get_upload(&upload_id).unwrap();
    assert!(upload.joined, "the join flag flips exactly once");
    assert_eq!(
        deployment.notifier.notifications(),
        vec![upload_id.to_string()],
        "cleanup notified exactly once"
    );
}

#[test]
fn test_failed_entry_does_not_fail_upload() {
    let deployment = Deployment::new();
    let upload = deployment.controller.create("u1", None, false, None).unwrap();
    let upload_id = upload.upload_id;

    let good = deployment.write_source("src/template.json", r#"{"run": {}}"#);
    deployment
        .controller
        .add_files(&upload_id, "u1", &good, RawPath::root(), false)
        .unwrap();
    deployment.controller.wait_for(&upload_id, WAIT).unwrap();

    let bad = deployment.write_source("src2/chaos.json", r#""exception""#);
    deployment
        .controller
        .add_files(&upload_id, "u1", &bad, RawPath::root(), false)
        .unwrap();
    let upload = deployment.controller.wait_for(&upload_id, WAIT).unwrap();
    assert_eq!(upload.process_status, ProcessStatus::Success);

    let entries = deployment.controller.get_entries(&upload_id).unwrap();
    assert_eq!(entries.len(), 2);
    let chaos = entries
        .iter()
        .find(|entry| entry.mainfile.as_str() == "chaos.json")
        .unwrap();
    assert_eq!(chaos.process_status, ProcessStatus::Failure);
    assert!(!chaos.errors.is_empty());

    // The partial archive is retained for forensics, with the logs.
    let staging = StagingUploadFiles::open(&deployment.ctx.layout, &upload_id).unwrap();
    let archive = staging.read_archive(&chaos.entry_id).unwrap();
    assert!(archive["processing_logs"].as_array().is_some());
    assert_eq!(archive["metadata"]["processed"], false);
}

#[test]
fn test_embargo_metadata_change_repacks_once() {
    let deployment = Deployment::new();
    let upload_id = deployment.processed_upload();
    deployment
        .controller
        .publish(&upload_id, "u1", Some(12))
        .unwrap();

    // Identical change: a no-op, even while published.
    deployment
        .controller
        .set_upload_metadata(
            &upload_id,
            "u1",
            UploadMetadataUpdate {
                embargo_length: Some(12),
                ..UploadMetadataUpdate::default()
            },
        )
        .unwrap();
    assert!(deployment
        .public_zip_members(&upload_id, AccessClass::Public)
        .is_empty());

    // Lifting through metadata repacks.
    deployment
        .controller
        .set_upload_metadata(
            &upload_id,
            "u1",
            UploadMetadataUpdate {
                embargo_length: Some(0),
                ..UploadMetadataUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(
        deployment
            .public_zip_members(&upload_id, AccessClass::Public)
            .len(),
        10
    );

    // And the second identical change is again a no-op.
    deployment
        .controller
        .set_upload_metadata(
            &upload_id,
            "u1",
            UploadMetadataUpdate {
                embargo_length: Some(0),
                ..UploadMetadataUpdate::default()
            },
        )
        .unwrap();
}

#[test]
fn test_non_admin_cannot_extend_published_embargo() {
    let deployment = Deployment::new();
    let upload_id = deployment.processed_upload();
    deployment
        .controller
        .publish(&upload_id, "u1", Some(6))
        .unwrap();

    let err = deployment
        .controller
        .set_upload_metadata(
            &upload_id,
            "u1",
            UploadMetadataUpdate {
                embargo_length: Some(12),
                ..UploadMetadataUpdate::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, QuarryError::BadRequest(_)));

    let err = deployment
        .controller
        .set_upload_metadata(
            &upload_id,
            "u1",
            UploadMetadataUpdate {
                main_author: Some("u2".to_string()),
                ..UploadMetadataUpdate::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, QuarryError::BadRequest(_)));

    // Admins may reassign authorship.
    deployment
        .controller
        .set_upload_metadata(
            &upload_id,
            "admin",
            UploadMetadataUpdate {
                main_author: Some("u2".to_string()),
                ..UploadMetadataUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(
        deployment.controller.get_upload(&upload_id).unwrap().main_author,
        "u2"
    );
}

#[test]
fn test_bundle_round_trip() {
    let source_deployment = Deployment::new();
    let upload_id = source_deployment.processed_upload();
    source_deployment
        .controller
        .publish(&upload_id, "u1", Some(12))
        .unwrap();
    let original = source_deployment.controller.get_upload(&upload_id).unwrap();

    let bundle_path = source_deployment.temp.path().join("bundle.zip");
    source_deployment
        .controller
        .export_bundle(
            &upload_id,
            "u1",
            Default::default(),
            ExportTarget::Zip(bundle_path.clone()),
        )
        .unwrap();

    let target_deployment = Deployment::new();
    let imported = target_deployment
        .controller
        .import_bundle(&bundle_path, "admin")
        .unwrap();

    assert_eq!(imported.upload_id, upload_id);
    assert_eq!(imported.publish_time, original.publish_time);
    assert_eq!(imported.process_status, ProcessStatus::Success);

    let original_entries = source_deployment.controller.get_entries(&upload_id).unwrap();
    let imported_entries = target_deployment.controller.get_entries(&upload_id).unwrap();
    assert_eq!(
        original_entries
            .iter()
            .map(|entry| entry.entry_id.clone())
            .collect::<Vec<_>>(),
        imported_entries
            .iter()
            .map(|entry| entry.entry_id.clone())
            .collect::<Vec<_>>()
    );

    // Byte-equal packed files on both sides.
    for deployment_files in [
        PublicUploadFiles::open(&source_deployment.ctx.layout, &upload_id).unwrap(),
        PublicUploadFiles::open(&target_deployment.ctx.layout, &upload_id).unwrap(),
    ]
    .windows(2)
    {
        for access in AccessClass::ALL {
            assert_eq!(
                read_file(&deployment_files[0].raw_zip_path(*access)),
                read_file(&deployment_files[1].raw_zip_path(*access)),
            );
            assert_eq!(
                read_file(&deployment_files[0].msg_archive_path(*access)),
                read_file(&deployment_files[1].msg_archive_path(*access)),
            );
        }
    }

    // The import is idempotent in the failure direction: importing again
    // refuses because the upload exists.
    let err = target_deployment
        .controller
        .import_bundle(&bundle_path, "admin")
        .unwrap_err();
    assert!(matches!(err, QuarryError::BundleImportFailure(_)));
}

#[test]
fn test_reprocess_published_upload() {
    let deployment = Deployment::new();
    let upload_id = deployment.processed_upload();
    deployment
        .controller
        .publish(&upload_id, "u1", Some(0))
        .unwrap();

    // Only admins may reprocess published uploads.
    let err = deployment.controller.reprocess(&upload_id, "u1").unwrap_err();
    assert!(matches!(err, QuarryError::Unauthorized(_)));

    deployment.controller.reprocess(&upload_id, "admin").unwrap();
    let upload = deployment.controller.wait_for(&upload_id, WAIT).unwrap();
    assert_eq!(upload.process_status, ProcessStatus::Success);

    // The staging copy is gone again and the public files are intact.
    assert!(!StagingUploadFiles::exists(&deployment.ctx.layout, &upload_id));
    assert_eq!(
        deployment
            .public_zip_members(&upload_id, AccessClass::Public)
            .len(),
        10
    );
    let entries = deployment.controller.get_entries(&upload_id).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|entry| entry.process_status == ProcessStatus::Success));
}

#[test]
fn test_reprocess_published_preserves_entries_when_configured() {
    let deployment = Deployment::with_config(|config| {
        config.reprocess.reparse_if_parser_unchanged = false;
        config.reprocess.reparse_if_parser_changed = false;
    });
    let upload_id = deployment.processed_upload();
    deployment
        .controller
        .publish(&upload_id, "u1", Some(0))
        .unwrap();
    let before = deployment.controller.get_entries(&upload_id).unwrap();

    deployment.controller.reprocess(&upload_id, "admin").unwrap();
    let upload = deployment.controller.wait_for(&upload_id, WAIT).unwrap();
    assert_eq!(upload.process_status, ProcessStatus::Success);

    let after = deployment.controller.get_entries(&upload_id).unwrap();
    assert_eq!(after.len(), before.len());
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.entry_id, new.entry_id);
        assert_eq!(old.entry_hash, new.entry_hash, "entries kept verbatim");
    }
}

#[test]
fn test_delete_upload() {
    let deployment = Deployment::new();
    let upload_id = deployment.processed_upload();

    // Non-writers may not delete.
    let err = deployment.controller.delete(&upload_id, "u2").unwrap_err();
    assert!(matches!(err, QuarryError::Unauthorized(_)));

    deployment.controller.delete(&upload_id, "u1").unwrap();
    assert!(matches!(
        deployment.controller.get_upload(&upload_id).unwrap_err(),
        QuarryError::NotFound(_)
    ));
    assert!(!StagingUploadFiles::exists(&deployment.ctx.layout, &upload_id));
    assert!(deployment.search.entry_ids(&upload_id).is_empty());
}

#[test]
fn test_force_fail_requires_running_process() {
    let deployment = Deployment::new();
    let upload_id = deployment.processed_upload();

    let err = deployment
        .controller
        .force_fail(&upload_id, "u1")
        .unwrap_err();
    assert!(matches!(err, QuarryError::Unauthorized(_)));

    // Nothing is processing, so there is nothing to kill.
    let err = deployment
        .controller
        .force_fail(&upload_id, "admin")
        .unwrap_err();
    assert!(matches!(err, QuarryError::BadRequest(_)));
}

#[test]
fn test_upload_limit() {
    let deployment = Deployment::with_config(|config| {
        config.process.upload_limit = 2;
    });
    deployment.controller.create("u1", None, false, None).unwrap();
    deployment.controller.create("u1", None, false, None).unwrap();
    let err = deployment
        .controller
        .create("u1", None, false, None)
        .unwrap_err();
    assert!(matches!(err, QuarryError::BadRequest(_)));

    // Admins are exempt.
    deployment.controller.create("admin", None, false, None).unwrap();
}

#[test]
fn test_embargo_aware_read_path() {
    let deployment = Deployment::new();
    let upload_id = deployment.processed_upload();
    deployment
        .controller
        .publish(&upload_id, "u1", Some(12))
        .unwrap();

    let path = RawPath::new("a/template.json").unwrap();
    // The author reads through the embargo.
    let mut stream = deployment
        .controller
        .open_raw_file(&upload_id, "u1", &path, 0, -1, false)
        .unwrap();
    let mut content = String::new();
    stream.read_to_string(&mut content).unwrap();
    assert!(content.contains("Template"));

    // Strangers do not.
    let err = match deployment
        .controller
        .open_raw_file(&upload_id, "u2", &path, 0, -1, false)
    {
        Err(e) => e,
        Ok(_) => panic!("expected error"),
    };
    assert!(matches!(err, QuarryError::Unauthorized(_)));

    let entry_id = generate_entry_id(&upload_id, "a/template.json");
    let err = deployment
        .controller
        .read_archive(&upload_id, "u2", &entry_id)
        .unwrap_err();
    assert!(matches!(err, QuarryError::Unauthorized(_)));
    let archive = deployment
        .controller
        .read_archive(&upload_id, "u1", &entry_id)
        .unwrap();
    assert_eq!(archive["run"]["program_name"], "Template");
}

#[test]
fn test_phonon_post_step_merges_method() {
    let deployment = Deployment::new();
    let upload = deployment.controller.create("u1", None, false, None).unwrap();
    let upload_id = upload.upload_id;

    let reference = deployment.write_source(
        "src/template.json",
        r#"{"run": {"program_name": "Template"}, "results": {"method": {"functional": "GGA"}}}"#,
    );
    deployment
        .controller
        .add_files(
            &upload_id,
            "u1",
            &reference,
            RawPath::new("calc").unwrap(),
            false,
        )
        .unwrap();
    deployment.controller.wait_for(&upload_id, WAIT).unwrap();

    let phonopy = deployment.write_source(
        "src2/phonopy.yaml",
        r#"{"references": ["calc/template.json"]}"#,
    );
    deployment
        .controller
        .add_files(
            &upload_id,
            "u1",
            &phonopy,
            RawPath::new("phonon").unwrap(),
            false,
        )
        .unwrap();
    let upload = deployment.controller.wait_for(&upload_id, WAIT).unwrap();
    assert_eq!(upload.process_status, ProcessStatus::Success);

    let phonon_id = generate_entry_id(&upload_id, "phonon/phonopy.yaml");
    let staging = StagingUploadFiles::open(&deployment.ctx.layout, &upload_id).unwrap();
    let archive = staging.read_archive(&phonon_id).unwrap();
    assert_eq!(archive["results"]["method"]["functional"], "GGA");
}

#[test]
fn test_raw_metadata_file() {
    let deployment = Deployment::new();
    let upload = deployment.controller.create("u1", None, false, None).unwrap();
    let upload_id = upload.upload_id;

    let source_dir = deployment.temp.path().join("with-metadata");
    fs::create_dir_all(source_dir.join("calc")).unwrap();
    fs::create_dir_all(source_dir.join("other")).unwrap();
    fs::write(
        source_dir.join("quarry.yaml"),
        "upload_name: named by file\n\
         embargo_length: 6\n\
         skip_matching: true\n\
         entries:\n\
           calc/template.json:\n\
             comment: from file\n",
    )
    .unwrap();
    fs::write(source_dir.join("calc/template.json"), r#"{"run": {}}"#).unwrap();
    fs::write(source_dir.join("other/template.json"), r#"{"run": {}}"#).unwrap();

    // Add the files one by one so they land at the raw root instead of
    // under the source directory's name.
    for child in ["quarry.yaml", "calc/template.json", "other/template.json"] {
        let target = if let Some((dir, _)) = child.rsplit_once('/') {
            RawPath::new(dir).unwrap()
        } else {
            RawPath::root()
        };
        deployment
            .controller
            .add_files(&upload_id, "u1", &source_dir.join(child), target, false)
            .unwrap();
        deployment.controller.wait_for(&upload_id, WAIT).unwrap();
    }

    let upload = deployment.controller.get_upload(&upload_id).unwrap();
    assert_eq!(upload.process_status, ProcessStatus::Success);
    assert_eq!(upload.upload_name.as_deref(), Some("named by file"));
    assert_eq!(upload.embargo_length, 6);

    // skip_matching restricts matching to the listed mainfiles.
    let entries = deployment.controller.get_entries(&upload_id).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].mainfile.as_str(), "calc/template.json");
    assert_eq!(entries[0].metadata.comment.as_deref(), Some("from file"));
}

#[test]
fn test_auxfile_cutoff_warning() {
    let deployment = Deployment::with_config(|config| {
        config.process.auxfile_cutoff = 3;
    });
    let upload = deployment.controller.create("u1", None, false, None).unwrap();
    let upload_id = upload.upload_id;

    let source_dir = deployment.temp.path().join("many");
    fs::create_dir_all(&source_dir).unwrap();
    fs::write(source_dir.join("template.json"), r#"{"run": {}}"#).unwrap();
    for aux in 0..8 {
        fs::write(source_dir.join(format!("{aux}.aux")), "aux").unwrap();
    }
    deployment
        .controller
        .add_files(&upload_id, "u1", &source_dir, RawPath::root(), false)
        .unwrap();
    deployment.controller.wait_for(&upload_id, WAIT).unwrap();

    let entries = deployment.controller.get_entries(&upload_id).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0]
        .warnings
        .iter()
        .any(|warning| warning.contains("aux files")));
}
