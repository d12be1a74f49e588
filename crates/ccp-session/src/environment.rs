use ccp_core::schema::Environment;
use std::env;
use sysinfo::System;

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Host metadata for the bundle: OS, terminal identity, CPU shape.
/// Nothing here identifies the user or the project.
pub fn discover(assistant_detected: bool) -> Environment {
    let mut system = System::new();
    system.refresh_cpu_all();
    system.refresh_memory();

    let cpu_count = system.cpus().len() as u32;
    let cpu_model = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty());

    Environment {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        term: env_var("TERM"),
        term_program: env_var("TERM_PROGRAM"),
        colorterm: env_var("COLORTERM"),
        cpu_count: (cpu_count > 0).then_some(cpu_count),
        cpu_model,
        total_mem_bytes: Some(system.total_memory()).filter(|total| *total > 0),
        assistant_detected,
    }
}
