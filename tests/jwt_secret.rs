use std::process::Command;

#[test]
fn startup_aborts_without_jwt_secret() {
    let exe = env!("CARGO_BIN_EXE_academy-billing");
    let output = Command::new(exe)
        .env_remove("JWT_SECRET")
        .env("DATABASE_URL", "postgres://billing@127.0.0.1:1/billing")
        .output()
        .expect("failed to run academy-billing binary");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("JWT_SECRET must be set"), "{stderr}");
}
