use anyhow::Result;

fn replica() -> assert_cmd::Command {
    assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("replica"))
}

#[test]
fn too_few_arguments_print_usage_and_succeed() -> Result<()> {
    let output = replica().args(["1", "127.0.0.1"]).output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("Usage"), "unexpected stdout: {stdout}");
    Ok(())
}

#[test]
fn missing_view_file_fails_startup() -> Result<()> {
    let output = replica()
        .args(["1", "127.0.0.1", "0", "--config-dir", "/nonexistent/replica-mesh"])
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("bootstrap view"), "unexpected stderr: {stderr}");
    Ok(())
}
