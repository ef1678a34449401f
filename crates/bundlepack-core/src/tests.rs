use super::*;

const SAMPLE_MANIFEST: &str = r#"
[bundle]
id = "contoso-suite"
name = "Contoso Suite"
version = "2.1.0"
upgrade_code = "contoso-suite-upgrade"
per_machine = true

[[containers]]
id = "primary"
primary = true
attached = true
attached_index = 0

[[payloads]]
key = "runtime.msi"
file_path = "runtime/runtime.msi"
container = "primary"
size = 1024
sha256 = "abc123"

[[payloads]]
key = "tool.exe"
file_path = "tool.exe"
download_url = "https://example.test/tool.exe"
size = 2048

[[rollback_boundaries]]
id = "core"

[[rollback_boundaries]]
id = "extras"
vital = false

[[packages]]
id = "runtime"
kind = "msi"
product_code = "{11111111-2222-3333-4444-555555555555}"
per_machine = true
rollback_boundary = "core"
payloads = ["runtime.msi"]

[[packages]]
id = "tool"
kind = "exe"
vital = false
permanent = true
rollback_boundary = "extras"
install_arguments = "/quiet"
detect_condition = "ToolInstalled"
payloads = ["tool.exe"]

[[packages.exit_codes]]
code = 1
behavior = "reboot-required"

[[packages.exit_codes]]
behavior = "error"

[[variables]]
name = "InstallFolder"
value = "/opt/contoso"
"#;

#[test]
fn parse_bundle_manifest() {
    let parsed = BundleManifest::from_toml_str(SAMPLE_MANIFEST).expect("manifest should parse");
    assert_eq!(parsed.bundle.id, "contoso-suite");
    assert_eq!(parsed.bundle.version.to_string(), "2.1.0");
    assert!(parsed.bundle.per_machine);
    assert_eq!(parsed.packages.len(), 2);
    assert_eq!(parsed.payloads.len(), 2);
    assert_eq!(parsed.rollback_boundaries.len(), 2);
    assert!(parsed.rollback_boundaries[0].vital);
    assert!(!parsed.rollback_boundaries[1].vital);

    let runtime = &parsed.packages[0];
    assert_eq!(runtime.kind(), PackageKind::Msi);
    assert!(runtime.vital);
    assert!(runtime.uninstallable());
    assert_eq!(runtime.cache_id(), "runtime");
    assert_eq!(runtime.primary_payload(), Some("runtime.msi"));

    let tool = &parsed.packages[1];
    assert_eq!(tool.kind(), PackageKind::Exe);
    assert!(!tool.vital);
    assert!(!tool.uninstallable());
    assert_eq!(tool.detect_condition(), Some("ToolInstalled"));
    let PackageDetails::Exe { exit_codes, .. } = &tool.details else {
        panic!("tool must be an exe package");
    };
    assert_eq!(exit_codes.len(), 2);
    assert_eq!(exit_codes[0].code, Some(1));
    assert_eq!(exit_codes[0].behavior, ExitCodeBehavior::RebootRequired);
    assert_eq!(exit_codes[1].code, None);
}

#[test]
fn parse_manifest_rejects_unknown_payload_reference() {
    let content = r#"
[bundle]
id = "demo"
version = "1.0.0"

[[packages]]
id = "a"
kind = "msu"
payloads = ["missing.msu"]
"#;
    let err = BundleManifest::from_toml_str(content).expect_err("unknown payload must fail");
    assert!(err.to_string().contains("unknown payload"));
}

#[test]
fn parse_manifest_rejects_attached_container_without_index() {
    let content = r#"
[bundle]
id = "demo"
version = "1.0.0"

[[containers]]
id = "c"
attached = true
"#;
    let err = BundleManifest::from_toml_str(content).expect_err("missing index must fail");
    assert!(err.to_string().contains("attached_index"));
}

#[test]
fn parse_manifest_rejects_escaping_payload_path() {
    let content = r#"
[bundle]
id = "demo"
version = "1.0.0"

[[payloads]]
key = "p"
file_path = "../evil.exe"
size = 1
"#;
    let err = BundleManifest::from_toml_str(content).expect_err("escaping path must fail");
    assert!(format!("{err:#}").contains("'..'"));
}

#[test]
fn parse_manifest_rejects_unknown_boundary() {
    let content = r#"
[bundle]
id = "demo"
version = "1.0.0"

[[payloads]]
key = "p.msi"
file_path = "p.msi"
size = 1

[[packages]]
id = "p"
kind = "msi"
product_code = "{P}"
rollback_boundary = "nope"
payloads = ["p.msi"]
"#;
    let err = BundleManifest::from_toml_str(content).expect_err("unknown boundary must fail");
    assert!(err.to_string().contains("unknown rollback boundary"));
}

#[test]
fn package_kind_parse_and_infer() {
    assert_eq!(PackageKind::parse(" MSI "), Some(PackageKind::Msi));
    assert_eq!(PackageKind::parse("zip"), None);
    assert_eq!(
        PackageKind::infer_from_path("https://example.test/a/setup.EXE?x=1#frag"),
        Some(PackageKind::Exe)
    );
    assert_eq!(
        PackageKind::infer_from_path(r"C:\payloads\kb123.msu"),
        Some(PackageKind::Msu)
    );
    assert_eq!(PackageKind::infer_from_path("README"), None);
    assert!(PackageKind::Exe.uninstall_needs_payloads());
    assert!(!PackageKind::Msi.uninstall_needs_payloads());
}

#[test]
fn current_state_after_action() {
    assert_eq!(
        CurrentState::Absent.after(ActionState::Install),
        CurrentState::Present
    );
    assert_eq!(
        CurrentState::Present.after(ActionState::Uninstall),
        CurrentState::Absent
    );
    assert_eq!(
        CurrentState::Present.after(ActionState::None),
        CurrentState::Present
    );
}

#[test]
fn resume_mode_tokens() {
    for mode in [
        ResumeMode::None,
        ResumeMode::Active,
        ResumeMode::Suspend,
        ResumeMode::RebootPending,
        ResumeMode::Arp,
    ] {
        assert_eq!(ResumeMode::parse(mode.as_str()).expect("must parse"), mode);
    }
    assert!(ResumeMode::Suspend.is_resumable());
    assert!(!ResumeMode::Arp.is_resumable());
    assert!(ResumeMode::parse("paused").is_err());
}

#[test]
fn persisted_variables_skip_builtins() {
    let mut variables = Variables::new();
    variables.set_string("InstallFolder", "/opt/contoso");
    variables.set_numeric("Features", 7);
    variables.set(
        "MinVersion",
        VariableValue::Version(semver::Version::new(1, 2, 3)),
    );
    variables.set_builtin("BundleAction", VariableValue::String("install".into()));

    let bytes = variables.serialize_persisted();

    let mut restored = Variables::new();
    restored.set_builtin("BundleAction", VariableValue::String("repair".into()));
    let loaded = restored
        .deserialize_persisted(&bytes)
        .expect("must load persisted variables");

    assert_eq!(loaded, 3);
    assert_eq!(
        restored.get_string("InstallFolder").as_deref(),
        Some("/opt/contoso")
    );
    assert_eq!(restored.get_numeric("Features"), Some(7));
    assert_eq!(
        restored.get_string("BundleAction").as_deref(),
        Some("repair")
    );
}

#[test]
fn persisted_variables_reject_other_layout_version_and_truncation() {
    let mut variables = Variables::new();
    variables.set_string("Name", "value");
    let mut bytes = variables.serialize_persisted();

    let mut truncated = Variables::new();
    assert!(truncated
        .deserialize_persisted(&bytes[..bytes.len() - 2])
        .is_err());

    bytes[0] = 9;
    let err = Variables::new()
        .deserialize_persisted(&bytes)
        .expect_err("foreign layout version must fail");
    assert!(err.to_string().contains("unsupported persisted variables version"));
}

#[test]
fn variable_truthiness() {
    assert!(VariableValue::Numeric(1).is_truthy());
    assert!(!VariableValue::Numeric(0).is_truthy());
    assert!(!VariableValue::String(String::new()).is_truthy());
}
