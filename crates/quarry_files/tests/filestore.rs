//! File store integration tests: packing, access segregation, extraction
//! round trips and the staging write path.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use quarry_files::{
    AccessClass, MsgArchiveReader, PackEntry, PackMode, PackOptions, PublicUploadFiles,
    StagingUploadFiles, StoreLayout,
};
use quarry_protocol::{generate_entry_id, FsConfig, QuarryError, RawPath, UploadId};
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    layout: StoreLayout,
    upload_id: UploadId,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let layout = StoreLayout::new(&FsConfig {
            staging_root: temp.path().join("staging"),
            public_root: temp.path().join("public"),
            tmp_root: temp.path().join("tmp"),
            prefix_size: 0,
            archive_version_suffix: None,
        });
        Self {
            _temp: temp,
            layout,
            upload_id: UploadId::generate(),
        }
    }

    fn staging(&self) -> StagingUploadFiles {
        StagingUploadFiles::create(&self.layout, &self.upload_id).unwrap()
    }

    fn public(&self) -> PublicUploadFiles {
        PublicUploadFiles::open(&self.layout, &self.upload_id).unwrap()
    }

    fn write_raw(&self, staging: &StagingUploadFiles, path: &str, content: &str) {
        let raw = RawPath::new(path).unwrap();
        let os_path = staging.raw_os_path(&raw);
        fs::create_dir_all(os_path.parent().unwrap()).unwrap();
        fs::write(os_path, content).unwrap();
    }

    fn entry(&self, staging: &StagingUploadFiles, mainfile: &str, with_embargo: bool) -> PackEntry {
        let mainfile = RawPath::new(mainfile).unwrap();
        let entry_id = generate_entry_id(&self.upload_id, mainfile.as_str());
        staging
            .write_archive(
                &entry_id,
                &serde_json::json!({"metadata": {"mainfile": mainfile.as_str()}}),
            )
            .unwrap();
        PackEntry {
            entry_id,
            mainfile,
            with_embargo,
        }
    }

    fn pack_options(&self) -> PackOptions {
        PackOptions {
            mode: PackMode::Pack,
            auxfile_cutoff: 100,
            target_dir: self.layout.public_dir(&self.upload_id),
        }
    }
}

fn zip_members(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut zip = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut members = BTreeMap::new();
    for index in 0..zip.len() {
        let mut member = zip.by_index(index).unwrap();
        if member.is_dir() {
            continue;
        }
        let mut bytes = Vec::new();
        member.read_to_end(&mut bytes).unwrap();
        members.insert(member.name().to_string(), bytes);
    }
    members
}

fn template_zip(temp: &Path) -> std::path::PathBuf {
    let path = temp.join("upload.zip");
    let file = File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for dir in ["a", "b"] {
        writer
            .start_file(format!("{dir}/template.json"), options)
            .unwrap();
        writer
            .write_all(br#"{"run": {"program_name": "template"}}"#)
            .unwrap();
        for aux in 1..=4 {
            writer.start_file(format!("{dir}/{aux}.aux"), options).unwrap();
            writer.write_all(b"aux content").unwrap();
        }
    }
    writer.finish().unwrap();
    path
}

#[test]
fn test_add_rawfiles_extracts_zip_to_root() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    let source = template_zip(fixture._temp.path());

    // The empty target dir addresses the raw root.
    staging
        .add_rawfiles(&source, &RawPath::root(), false)
        .unwrap();

    assert!(staging.raw_path_is_file(&RawPath::new("a/template.json").unwrap()));
    assert!(staging.raw_path_is_file(&RawPath::new("b/4.aux").unwrap()));
    let listing = staging
        .raw_directory_list(&RawPath::root(), true, true, None)
        .unwrap();
    assert_eq!(listing.len(), 10);
}

#[test]
fn test_add_rawfiles_into_subdirectory_with_cleanup() {
    let fixture = Fixture::new();
    let staging = fixture.staging();

    let source_dir = fixture._temp.path().join("incoming");
    fs::create_dir(&source_dir).unwrap();
    let source = source_dir.join("data.json");
    fs::write(&source, "{}").unwrap();

    staging
        .add_rawfiles(&source, &RawPath::new("nested/dir").unwrap(), true)
        .unwrap();

    assert!(staging.raw_path_is_file(&RawPath::new("nested/dir/data.json").unwrap()));
    assert!(!source.exists(), "cleanup must remove the source");
    assert!(!source_dir.exists(), "cleanup must remove the parent dir");
}

#[test]
fn test_add_rawfiles_overrides_existing() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    fixture.write_raw(&staging, "a/template.json", "old");

    let source = fixture._temp.path().join("template.json");
    fs::write(&source, "new").unwrap();
    staging
        .add_rawfiles(&source, &RawPath::new("a").unwrap(), false)
        .unwrap();

    let mut content = String::new();
    staging
        .open_raw_file(&RawPath::new("a/template.json").unwrap(), 0, -1, false)
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "new");
}

#[test]
fn test_file_along_target_dir_is_replaced() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    fixture.write_raw(&staging, "blocker", "i am a file");

    let source = fixture._temp.path().join("data.json");
    fs::write(&source, "{}").unwrap();
    staging
        .add_rawfiles(&source, &RawPath::new("blocker/sub").unwrap(), false)
        .unwrap();

    assert!(staging.raw_path_is_file(&RawPath::new("blocker/sub/data.json").unwrap()));
}

#[test]
fn test_delete_rawfiles_root_empties_raw() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    fixture.write_raw(&staging, "a/template.json", "{}");

    staging.delete_rawfiles(&RawPath::root()).unwrap();
    assert!(staging.raw_dir().is_dir(), "raw dir itself must survive");
    assert!(staging
        .raw_directory_list(&RawPath::root(), true, true, None)
        .unwrap()
        .is_empty());
}

#[test]
fn test_delete_missing_path_is_not_found() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    let err = staging
        .delete_rawfiles(&RawPath::new("no/such/file").unwrap())
        .unwrap_err();
    assert!(matches!(err, QuarryError::NotFound(_)));
}

#[test]
fn test_frozen_staging_refuses_writes() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    fixture.write_raw(&staging, "a/template.json", "{}");
    let entries = vec![fixture.entry(&staging, "a/template.json", false)];
    staging.pack(&entries, &fixture.pack_options()).unwrap();

    let source = fixture._temp.path().join("late.json");
    fs::write(&source, "{}").unwrap();
    let err = staging
        .add_rawfiles(&source, &RawPath::root(), false)
        .unwrap_err();
    assert!(matches!(err, QuarryError::BadRequest(_)));

    // A second pack must also refuse.
    let err = staging.pack(&entries, &fixture.pack_options()).unwrap_err();
    assert!(matches!(err, QuarryError::PackFailure(_)));
}

#[test]
fn test_pack_without_embargo_is_public() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    for dir in ["a", "b"] {
        fixture.write_raw(&staging, &format!("{dir}/template.json"), "{}");
        for aux in 1..=4 {
            fixture.write_raw(&staging, &format!("{dir}/{aux}.aux"), "aux");
        }
    }
    let entries = vec![
        fixture.entry(&staging, "a/template.json", false),
        fixture.entry(&staging, "b/template.json", false),
    ];
    staging.pack(&entries, &fixture.pack_options()).unwrap();

    let public = fixture.public();
    let public_members = zip_members(&public.raw_zip_path(AccessClass::Public));
    let restricted_members = zip_members(&public.raw_zip_path(AccessClass::Restricted));
    assert_eq!(public_members.len(), 10);
    assert!(restricted_members.is_empty());
    assert!(public_members.contains_key("a/template.json"));
    assert!(public_members.contains_key("b/4.aux"));

    // One archive record per entry, in the public msg archive.
    let mut reader = MsgArchiveReader::open(&public.msg_archive_path(AccessClass::Public)).unwrap();
    assert_eq!(reader.len(), 2);
    let (archive, access) = public.read_archive(&entries[0].entry_id).unwrap();
    assert_eq!(access, AccessClass::Public);
    assert_eq!(archive["metadata"]["mainfile"], "a/template.json");
    assert!(reader.contains(&entries[1].entry_id));
}

#[test]
fn test_pack_with_embargo_is_restricted() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    fixture.write_raw(&staging, "a/template.json", "{}");
    fixture.write_raw(&staging, "a/1.aux", "aux");
    let entries = vec![fixture.entry(&staging, "a/template.json", true)];
    staging.pack(&entries, &fixture.pack_options()).unwrap();

    let public = fixture.public();
    assert!(zip_members(&public.raw_zip_path(AccessClass::Public)).is_empty());
    let restricted = zip_members(&public.raw_zip_path(AccessClass::Restricted));
    assert_eq!(restricted.len(), 2);

    let (_, access) = public.read_archive(&entries[0].entry_id).unwrap();
    assert_eq!(access, AccessClass::Restricted);
}

#[test]
fn test_shared_directory_embargo_segregation() {
    // Two mainfiles share a directory, one embargoed: the embargoed mainfile
    // must be restricted even though it is an aux file of the public entry.
    let fixture = Fixture::new();
    let staging = fixture.staging();
    fixture.write_raw(&staging, "a/m1.json", "{}");
    fixture.write_raw(&staging, "a/m2.json", "{}");
    fixture.write_raw(&staging, "a/shared.aux", "aux");
    let entries = vec![
        fixture.entry(&staging, "a/m1.json", true),
        fixture.entry(&staging, "a/m2.json", false),
    ];
    staging.pack(&entries, &fixture.pack_options()).unwrap();

    let public = fixture.public();
    let public_members = zip_members(&public.raw_zip_path(AccessClass::Public));
    let restricted_members = zip_members(&public.raw_zip_path(AccessClass::Restricted));

    assert!(public_members.contains_key("a/m2.json"));
    assert!(public_members.contains_key("a/shared.aux"));
    assert!(!public_members.contains_key("a/m1.json"));
    assert!(restricted_members.contains_key("a/m1.json"));
    assert_eq!(restricted_members.len(), 1);
}

#[test]
fn test_auxfile_cutoff() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    let cutoff = 10usize;
    fixture.write_raw(&staging, "calc/template.json", "{}");
    for aux in 0..cutoff + 5 {
        fixture.write_raw(&staging, &format!("calc/{aux:02}.aux"), "aux");
    }

    let mainfile = RawPath::new("calc/template.json").unwrap();
    let files = staging.entry_files(&mainfile, cutoff).unwrap();
    assert_eq!(files.len(), cutoff + 1);
    assert_eq!(files[0], mainfile);
    // Aux files are sorted ascending and cut off.
    let aux: Vec<&str> = files[1..].iter().map(|f| f.as_str()).collect();
    assert_eq!(aux[0], "calc/00.aux");
    assert_eq!(aux[cutoff - 1], "calc/09.aux");
}

#[test]
fn test_potcar_never_public() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    fixture.write_raw(&staging, "calc/template.json", "{}");
    fixture.write_raw(&staging, "calc/POTCAR", "licensed pseudopotential");
    staging
        .preprocess_potcar(&RawPath::new("calc/POTCAR").unwrap())
        .unwrap();
    let entries = vec![fixture.entry(&staging, "calc/template.json", false)];
    staging.pack(&entries, &fixture.pack_options()).unwrap();

    let public = fixture.public();
    let public_members = zip_members(&public.raw_zip_path(AccessClass::Public));
    let restricted_members = zip_members(&public.raw_zip_path(AccessClass::Restricted));

    assert!(!public_members.contains_key("calc/POTCAR"));
    assert!(public_members.contains_key("calc/POTCAR.stripped"));
    assert!(restricted_members.contains_key("calc/POTCAR"));
    let stripped = String::from_utf8(public_members["calc/POTCAR.stripped"].clone()).unwrap();
    assert!(stripped.contains("sha224"), "stripped file records a checksum");
}

#[test]
fn test_pack_extract_repack_round_trip() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    fixture.write_raw(&staging, "a/template.json", r#"{"run": 1}"#);
    fixture.write_raw(&staging, "a/1.aux", "aux one");
    fixture.write_raw(&staging, "b/template.json", r#"{"run": 2}"#);
    let entries = vec![
        fixture.entry(&staging, "a/template.json", false),
        fixture.entry(&staging, "b/template.json", true),
    ];
    staging.pack(&entries, &fixture.pack_options()).unwrap();

    let public = fixture.public();
    let original_public = zip_members(&public.raw_zip_path(AccessClass::Public));
    let original_restricted = zip_members(&public.raw_zip_path(AccessClass::Restricted));

    // Extract back after dropping the original staging tree.
    staging.delete().unwrap();
    let extracted = public.to_staging().unwrap();

    let listing = extracted
        .raw_directory_list(&RawPath::root(), true, true, None)
        .unwrap();
    let paths: Vec<&str> = listing.iter().map(|info| info.path.as_str()).collect();
    assert_eq!(paths, vec!["a/1.aux", "a/template.json", "b/template.json"]);
    for entry in &entries {
        let archive = extracted.read_archive(&entry.entry_id).unwrap();
        assert_eq!(archive["metadata"]["mainfile"], entry.mainfile.as_str());
    }

    // Repacking the extracted tree yields the same member sets and bytes.
    extracted
        .pack(
            &entries,
            &PackOptions {
                mode: PackMode::Repack,
                ..fixture.pack_options()
            },
        )
        .unwrap();
    assert_eq!(
        zip_members(&public.raw_zip_path(AccessClass::Public)),
        original_public
    );
    assert_eq!(
        zip_members(&public.raw_zip_path(AccessClass::Restricted)),
        original_restricted
    );
}

#[test]
fn test_public_repack_lifts_embargo() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    fixture.write_raw(&staging, "a/template.json", "{}");
    fixture.write_raw(&staging, "a/1.aux", "aux");
    let mut entries = vec![fixture.entry(&staging, "a/template.json", true)];
    staging.pack(&entries, &fixture.pack_options()).unwrap();

    let public = fixture.public();
    assert!(zip_members(&public.raw_zip_path(AccessClass::Public)).is_empty());

    entries[0].with_embargo = false;
    public.repack(&entries, 100).unwrap();

    let public_members = zip_members(&public.raw_zip_path(AccessClass::Public));
    assert_eq!(public_members.len(), 2);
    assert!(zip_members(&public.raw_zip_path(AccessClass::Restricted)).is_empty());
    let (_, access) = public.read_archive(&entries[0].entry_id).unwrap();
    assert_eq!(access, AccessClass::Public);
}

#[test]
fn test_public_open_raw_file_windows() {
    let fixture = Fixture::new();
    let staging = fixture.staging();
    fixture.write_raw(&staging, "data.txt", "0123456789");
    let entries = vec![fixture.entry(&staging, "data.txt", false)];
    staging.pack(&entries, &fixture.pack_options()).unwrap();

    let public = fixture.public();
    let path = RawPath::new("data.txt").unwrap();

    let (mut stream, access) = public.open_raw_file(&path, 3, 4, false).unwrap();
    let mut content = String::new();
    stream.read_to_string(&mut content).unwrap();
    assert_eq!(content, "3456");
    assert_eq!(access, AccessClass::Public);

    // offset == size gives an empty stream, beyond it a bad request
    let (mut stream, _) = public.open_raw_file(&path, 10, -1, false).unwrap();
    let mut content = String::new();
    stream.read_to_string(&mut content).unwrap();
    assert!(content.is_empty());
    assert!(matches!(
        public.open_raw_file(&path, 11, -1, false).err().unwrap(),
        QuarryError::BadRequest(_)
    ));
}
