//! Job script rendering.
//!
//! Scripts are minijinja templates. Directives for settings the template
//! does not mention (queue, account, qos, time limit, job array, free-form
//! options) are spliced in right after the first line before rendering, so
//! a user template only needs the parts it wants to control.

use std::collections::BTreeMap;

use minijinja::Environment;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::cluster::Role;
use crate::error::LauncherError;
use crate::ssh::shell_join;

use super::system::{BatchSystem, Directive};

/// Variables available to job templates.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub role: Role,
    pub n: usize,
    pub profile_dir: String,
    pub cluster_id: String,
    pub queue: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,
    pub timelimit: Option<String>,
    pub options: Option<String>,
    pub work_dir: String,
    /// argv of the program the job runs.
    pub command: Vec<String>,
    /// Extra user variables. Built-in names win on conflict.
    pub namespace: BTreeMap<String, String>,
}

impl BatchContext {
    pub fn to_value(&self) -> Value {
        let mut map: serde_json::Map<String, Value> = self
            .namespace
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let (executable, arguments) = match self.command.split_first() {
            Some((exe, rest)) => (exe.clone(), shell_join(rest)),
            None => (String::new(), String::new()),
        };
        let builtins = json!({
            "role": self.role.as_str(),
            "n": self.n,
            "profile_dir": self.profile_dir,
            "cluster_id": self.cluster_id,
            "queue": self.queue,
            "account": self.account,
            "qos": self.qos,
            "timelimit": self.timelimit,
            "options": self.options,
            "work_dir": self.work_dir,
            "command": shell_join(&self.command),
            "executable": executable,
            "arguments": arguments,
        });
        if let Value::Object(builtins) = builtins {
            map.extend(builtins);
        }
        Value::Object(map)
    }
}

fn missing(directive: Option<Directive>, template: &str) -> Result<Option<&'static str>, LauncherError> {
    let Some(d) = directive else {
        return Ok(None);
    };
    if Regex::new(d.regex)?.is_match(template) {
        Ok(None)
    } else {
        Ok(Some(d.template))
    }
}

/// Splice in directives the template lacks.
///
/// Added lines go right after the first (shebang) line in a fixed order:
/// the job-array directive first, then queue, account, qos, time limit and
/// free-form options. Systems that want the array directive last
/// (`job_array_at_end`) get it appended instead. Directives already in the
/// template stay where the author put them.
pub fn add_missing_directives(
    system: BatchSystem,
    template: &str,
    ctx: &BatchContext,
) -> Result<String, LauncherError> {
    let mut header: Vec<String> = Vec::new();
    let mut footer: Option<&'static str> = None;

    if let Some(line) = missing(system.job_array(), template)? {
        if system.job_array_at_end() {
            footer = Some(line);
        } else {
            header.push(line.to_string());
        }
    }
    let settings = [
        (system.queue(), ctx.queue.is_some()),
        (system.account(), ctx.account.is_some()),
        (system.qos(), ctx.qos.is_some()),
        (system.timelimit(), ctx.timelimit.is_some()),
    ];
    for (directive, wanted) in settings {
        if wanted {
            if let Some(line) = missing(directive, template)? {
                header.push(line.to_string());
            }
        }
    }
    if system != BatchSystem::WindowsHpc {
        if let Some(options) = ctx.options.as_deref().map(str::trim_end) {
            if !options.is_empty() && !template.contains(options) {
                header.push(options.to_string());
            }
        }
    }

    let mut script = match template.split_once('\n') {
        Some((first, rest)) if !header.is_empty() => {
            debug!(system = %system, added = header.len(), "adding batch directives");
            format!("{first}\n{}\n{rest}", header.join("\n"))
        }
        None if !header.is_empty() => format!("{template}\n{}\n", header.join("\n")),
        _ => template.to_string(),
    };
    if let Some(line) = footer {
        if !script.ends_with('\n') {
            script.push('\n');
        }
        script.push_str(line);
        script.push('\n');
    }
    Ok(script)
}

pub fn render(template: &str, ctx: &BatchContext) -> Result<String, LauncherError> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    Ok(env.render_str(template, ctx.to_value())?)
}

/// Directives plus rendering: the exact script that gets submitted.
pub fn build_script(system: BatchSystem, template: &str, ctx: &BatchContext) -> Result<String, LauncherError> {
    let full = add_missing_directives(system, template, ctx)?;
    render(&full, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BatchContext {
        BatchContext {
            role: Role::Engine,
            n: 4,
            profile_dir: "/home/u/.kluster/profile_default".into(),
            cluster_id: String::new(),
            queue: None,
            account: None,
            qos: None,
            timelimit: None,
            options: None,
            work_dir: "/home/u".into(),
            command: vec!["kluster-engine".into(), "--profile-dir".into(), "/p".into()],
            namespace: BTreeMap::new(),
        }
    }

    #[test]
    fn pbs_queue_inserted_once_after_first_line() {
        let mut c = ctx();
        c.queue = Some("gpu".into());
        let template = "#!/bin/sh\n#PBS -V\n{{ command }}\n";
        let script = build_script(BatchSystem::Pbs, template, &c).unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "#!/bin/sh");
        assert_eq!(lines[1], "#PBS -t 1-4");
        assert_eq!(lines[2], "#PBS -q gpu");
        assert_eq!(lines[3], "#PBS -V");
        assert_eq!(script.matches("#PBS -q").count(), 1);
        assert!(script.contains("kluster-engine --profile-dir /p"));
    }

    #[test]
    fn existing_queue_directive_is_kept() {
        let mut c = ctx();
        c.queue = Some("gpu".into());
        let template = "#!/bin/sh\n#PBS -q {{ queue }}\n#PBS -t 1-{{ n }}\nrun\n";
        let script = build_script(BatchSystem::Pbs, template, &c).unwrap();
        assert_eq!(script, "#!/bin/sh\n#PBS -q gpu\n#PBS -t 1-4\nrun\n");
    }

    #[test]
    fn unset_settings_add_nothing() {
        let template = "#!/bin/sh\n#SBATCH --ntasks={{ n }}\nsrun x\n";
        let script = build_script(BatchSystem::Slurm, template, &ctx()).unwrap();
        assert_eq!(script, "#!/bin/sh\n#SBATCH --ntasks=4\nsrun x\n");
    }

    #[test]
    fn slurm_gets_account_qos_time_and_options() {
        let mut c = ctx();
        c.queue = Some("short".into());
        c.account = Some("proj1".into());
        c.qos = Some("high".into());
        c.timelimit = Some("01:00:00".into());
        c.options = Some("#SBATCH --exclusive".into());
        let script = build_script(BatchSystem::Slurm, BatchSystem::Slurm.default_template(Role::Engine), &c)
            .unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            &lines[..7],
            &[
                "#!/bin/sh",
                "#SBATCH --ntasks=4",
                "#SBATCH --partition=short",
                "#SBATCH --account=proj1",
                "#SBATCH --qos=high",
                "#SBATCH --time=01:00:00",
                "#SBATCH --exclusive",
            ]
        );
    }

    #[test]
    fn condor_queue_statement_goes_last() {
        let script = build_script(
            BatchSystem::HtCondor,
            BatchSystem::HtCondor.default_template(Role::Engine),
            &ctx(),
        )
        .unwrap();
        assert!(script.starts_with("universe = vanilla\n"));
        assert!(script.contains("executable = kluster-engine\n"));
        assert!(script.contains("arguments = \"--profile-dir /p\"\n"));
        assert!(script.ends_with("queue 4\n"));
    }

    #[test]
    fn lsf_job_array_names_the_role() {
        let script = build_script(BatchSystem::Lsf, BatchSystem::Lsf.default_template(Role::Engine), &ctx())
            .unwrap();
        assert_eq!(script.lines().nth(1), Some("#BSUB -J kluster-engine[1-4]"));
    }

    #[test]
    fn windows_job_file_has_no_directives() {
        let mut c = ctx();
        c.queue = Some("ignored".into());
        c.options = Some("#X".into());
        let script = build_script(
            BatchSystem::WindowsHpc,
            BatchSystem::WindowsHpc.default_template(Role::Engine),
            &c,
        )
        .unwrap();
        assert!(script.contains(r#"EndValue="4""#));
        assert!(!script.contains("ignored"));
        assert!(!script.contains("#X"));
    }

    #[test]
    fn namespace_variables_render_but_builtins_win() {
        let mut c = ctx();
        c.namespace.insert("mem".into(), "8gb".into());
        c.namespace.insert("n".into(), "999".into());
        let out = render("{{ mem }} {{ n }}", &c).unwrap();
        assert_eq!(out, "8gb 4");
    }

    #[test]
    fn single_line_template_still_gets_directives() {
        let mut c = ctx();
        c.queue = Some("q".into());
        let script = build_script(BatchSystem::Sge, "#$ -V", &c).unwrap();
        assert_eq!(script, "#$ -V\n#$ -t 1-4\n#$ -q q\n");
    }
}
