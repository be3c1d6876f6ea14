use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use impedit_core::testing::PeFixture;
use impedit_core::Image;
use tempfile::TempDir;

fn impedit(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_impedit"))
        .args(args)
        .env("IMPEDIT_LOG", "info")
        .output()
        .expect("failed to spawn impedit")
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn workspace() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("app.exe");
    let bytes = PeFixture::new()
        .import("kernel32.dll", &["ExitProcess", "Sleep"])
        .build();
    fs::write(&target, bytes).unwrap();
    (dir, target)
}

fn imports_of(path: &Path) -> Vec<String> {
    let image = Image::parse(fs::read(path).unwrap()).unwrap();
    image.list_imports().map(|r| r.to_string()).collect()
}

fn arg(name: &str, path: &Path) -> String {
    format!("--{name}:{}", path.display())
}

#[test]
fn add_with_force_writes_default_output() {
    let (dir, target) = workspace();
    let original = fs::read(&target).unwrap();

    let out = impedit(&["--action:add", &arg("target", &target), "--symbol:user32.dll::MessageBoxA", "--force"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let saved = dir.path().join("app_modified.exe");
    assert_eq!(
        imports_of(&saved),
        ["kernel32.dll::ExitProcess", "kernel32.dll::Sleep", "user32.dll::MessageBoxA"]
    );
    assert_eq!(fs::read(&target).unwrap(), original);
    assert!(stderr(&out).contains("Modified binary saved to"));
}

#[test]
fn remove_without_force_is_refused() {
    let (dir, target) = workspace();

    let out = impedit(&["--action:remove", &arg("target", &target), "--symbol:kernel32.dll::Sleep"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("--force"));
    assert!(!dir.path().join("app_modified.exe").exists());
}

#[test]
fn forced_remove_with_explicit_save_path() {
    let (dir, target) = workspace();
    let save = dir.path().join("out.exe");

    let out = impedit(&[
        "--action",
        "remove",
        "--target",
        target.to_str().unwrap(),
        "--symbol",
        "kernel32.dll::Sleep",
        "--force",
        "--save",
        save.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(imports_of(&save), ["kernel32.dll::ExitProcess"]);
    assert_eq!(fs::metadata(&save).unwrap().len(), fs::metadata(&target).unwrap().len());
}

#[test]
fn duplicate_add_fails_without_writing() {
    let (dir, target) = workspace();

    let out = impedit(&["--action:add", &arg("target", &target), "--symbol:kernel32.dll::ExitProcess", "--force"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("import already exists: kernel32.dll::ExitProcess"));
    assert!(!dir.path().join("app_modified.exe").exists());
}

#[test]
fn ignore_case_treats_module_names_alike() {
    let (dir, target) = workspace();

    let out = impedit(&[
        "--action:add",
        &arg("target", &target),
        "--symbol:KERNEL32.DLL::ExitProcess",
        "--force",
        "--ignore-case",
    ]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!dir.path().join("app_modified.exe").exists());

    let out = impedit(&["--action:add", &arg("target", &target), "--symbol:KERNEL32.DLL::ExitProcess", "--force"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
}

#[test]
fn add_validates_against_dll_exports() {
    let (dir, target) = workspace();
    let dll = dir.path().join("helper.dll");
    fs::write(&dll, PeFixture::new().exports("helper.dll", &["Alpha", "Beta"]).build()).unwrap();
    let save = dir.path().join("hooked.exe");

    let out = impedit(&[
        "--action:add",
        &arg("target", &target),
        &format!("--symbol:{}::Beta", dll.display()),
        &arg("save", &save),
    ]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(imports_of(&save).contains(&"helper.dll::Beta".to_string()));

    fs::remove_file(&save).unwrap();
    let out = impedit(&[
        "--action:add",
        &arg("target", &target),
        &format!("--symbol:{}::Gamma", dll.display()),
        &arg("save", &save),
    ]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("does not export Gamma"));
    assert!(stderr(&out).contains("TIP"));
    assert!(!save.exists());
}

#[test]
fn add_fails_when_dll_is_missing() {
    let (dir, target) = workspace();
    let out = impedit(&[
        "--action:add",
        &arg("target", &target),
        &format!("--symbol:{}::Init", dir.path().join("absent.dll").display()),
    ]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("could not be loaded"));
    assert!(!dir.path().join("app_modified.exe").exists());
}

#[test]
fn list_prints_imports_and_exports() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("lib.dll");
    let bytes = PeFixture::new()
        .import("kernel32.dll", &["ExitProcess"])
        .exports("lib.dll", &["Run"])
        .build();
    fs::write(&target, bytes).unwrap();

    let out = impedit(&["--action:list", &arg("target", &target)]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("Imported functions:"));
    assert!(text.contains("  Import - kernel32.dll::ExitProcess ("));
    assert!(text.contains("Exported functions:"));
    assert!(text.contains("  Export - lib.dll::Run (1000)"));

    let (_dir, plain) = workspace();
    let out = impedit(&["--action:list", &arg("target", &plain)]);
    assert!(stdout(&out).contains("No exported functions found!"));
}

#[test]
fn missing_target_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = impedit(&["--action:list", &arg("target", &dir.path().join("nothing.exe"))]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("does not exist"));
}

#[test]
fn missing_symbol_and_save_dir_fail_before_writing() {
    let (dir, target) = workspace();

    let out = impedit(&["--action:add", &arg("target", &target)]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("no symbol specified"));

    let save = dir.path().join("missing").join("out.exe");
    let out = impedit(&["--action:add", &arg("target", &target), "--symbol:a.dll::F", "--force", &arg("save", &save)]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("save directory does not exist"));

    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn unparseable_target_fails() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("notes.exe");
    fs::write(&target, b"MZ but not much else").unwrap();

    let out = impedit(&["--action:list", &arg("target", &target)]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("failed to parse"));
}

#[test]
fn bad_arguments_exit_with_one() {
    let out = impedit(&["--action:list", "--target:x.exe", "--bogus"]);
    assert_eq!(out.status.code(), Some(1));

    let out = impedit(&["--action:add", "--target:x.exe", "--symbol:no-separator"]);
    assert_eq!(out.status.code(), Some(1));
}
