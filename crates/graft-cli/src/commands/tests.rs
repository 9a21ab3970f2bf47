//! Unit tests for CLI commands.

use super::*;
use crate::output::colors::ColorSupport;
use tempfile::TempDir;

fn bundle_dir(files: &[(&str, &str)]) -> (TempDir, Utf8PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    for (name, content) in files {
        fs::write(path.join(name), content).unwrap();
    }
    (temp_dir, path)
}

fn test_context(cwd: &Utf8Path) -> CommandContext {
    CommandContext {
        cwd: cwd.to_path_buf(),
        output: OutputHandler::with_colors(ColorSupport::disabled()),
        config: FrameworkConfig::default(),
        source: ConfigSource::Defaults,
    }
}

const EXPORTER: &str = r#"
symbolic-name = "com.example.a"
version = "1.0.0"

[[exports]]
name = "com.example.api"
version = "1.0.0"
"#;

const IMPORTER: &str = r#"
symbolic-name = "com.example.b"
version = "1.0.0"
activator = "log"

[[imports]]
name = "com.example.api"
"#;

const BROKEN_IMPORT: &str = r#"
symbolic-name = "com.example.c"
version = "1.0.0"

[[imports]]
name = "com.example.missing"
"#;

#[test]
fn test_parse_overrides() {
    let overrides = parse_overrides(&[
        "begin-start-level=3".to_string(),
        " purge-unused = false ".to_string(),
    ])
    .unwrap();
    assert_eq!(overrides["begin-start-level"], "3");
    assert_eq!(overrides["purge-unused"], "false");

    assert!(parse_overrides(&["no-equals".to_string()]).is_err());
    assert!(parse_overrides(&["=value".to_string()]).is_err());
}

#[test]
fn test_bundle_files_sorted_and_filtered() {
    let (_guard, dir) = bundle_dir(&[
        ("b.toml", IMPORTER),
        ("a.toml", EXPORTER),
        ("notes.txt", "not a bundle"),
    ]);
    let files = bundle_files(&dir).unwrap();
    let names: Vec<&str> = files.iter().filter_map(|path| path.file_name()).collect();
    assert_eq!(names, vec!["a.toml", "b.toml"]);
}

#[test]
fn test_install_all_rejects_empty_dir() {
    let (_guard, dir) = bundle_dir(&[]);
    let framework = Framework::new(FrameworkConfig::default()).unwrap();
    let err = install_all(&framework, &dir).unwrap_err();
    assert!(err.to_string().contains("no bundle descriptors"));
}

#[test]
fn test_check_reports_invalid_descriptors() {
    let (_guard, dir) = bundle_dir(&[("a.toml", EXPORTER), ("bad.toml", "symbolic-name = ")]);
    let ctx = test_context(&dir);

    let err = check::execute(Some(&dir), &ctx).unwrap_err();
    assert!(err.to_string().contains("1 descriptor(s)"));

    fs::remove_file(dir.join("bad.toml")).unwrap();
    check::execute(Some(Utf8Path::new(".")), &ctx).unwrap();
}

#[test]
fn test_resolve_wires_bundles() {
    let (_guard, dir) = bundle_dir(&[("a.toml", EXPORTER), ("b.toml", IMPORTER)]);
    let ctx = test_context(&dir);

    let reports = resolve::resolve_dir(&dir, &ctx).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|report| report.state == "RESOLVED"));

    let importer = &reports[1];
    assert_eq!(importer.name, "com.example.b");
    assert_eq!(importer.wires.len(), 1);
    assert_eq!(importer.wires[0].name, "com.example.api");
    assert_eq!(importer.wires[0].provider, reports[0].id);

    let json = serde_json::to_value(&reports).unwrap();
    assert_eq!(json[1]["wires"][0]["provider"], reports[0].id);
    assert!(json[0].get("errors").is_none());
}

#[test]
fn test_resolve_fails_on_missing_import() {
    let (_guard, dir) = bundle_dir(&[("a.toml", EXPORTER), ("c.toml", BROKEN_IMPORT)]);
    let ctx = test_context(&dir);

    let reports = resolve::resolve_dir(&dir, &ctx).unwrap();
    assert!(reports[0].errors.is_empty());
    assert_eq!(reports[1].errors.len(), 1);

    let err = resolve::execute(&dir, true, &ctx).unwrap_err();
    assert!(err.to_string().contains("1 bundle(s) did not resolve"));
}

#[test]
fn test_run_starts_and_stops_bundles() {
    let (_guard, dir) = bundle_dir(&[("a.toml", EXPORTER), ("b.toml", IMPORTER)]);
    let ctx = test_context(&dir);
    run::execute(&dir, None, &ctx).unwrap();
}

#[test]
fn test_status_needs_cache_dir() {
    let (_guard, dir) = bundle_dir(&[]);
    let ctx = test_context(&dir);
    assert!(status::execute(&ctx).is_err());
}

#[test]
fn test_status_lists_cached_bundles() {
    let (_guard, dir) = bundle_dir(&[("a.toml", EXPORTER)]);
    let mut ctx = test_context(&dir);
    ctx.config.framework.cache_dir = Some(dir.join("cache"));

    let framework = Framework::new(ctx.config.clone()).unwrap();
    install_all(&framework, &dir).unwrap();
    framework.shutdown().unwrap();
    drop(framework);

    status::execute(&ctx).unwrap();
    let archives = status::recorded(&dir.join("cache")).unwrap();
    assert_eq!(archives.len(), 1);
    assert!(archives[0].location.ends_with("a.toml"));
    assert_eq!(archives[0].revisions.len(), 1);
}

#[test]
fn test_status_rejects_damaged_cache() {
    let (_guard, dir) = bundle_dir(&[]);
    let mut ctx = test_context(&dir);
    let cache = dir.join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(cache.join("index.json"), "[{").unwrap();
    ctx.config.framework.cache_dir = Some(cache);

    assert!(status::execute(&ctx).is_err());
}
