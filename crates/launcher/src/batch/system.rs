//! Per-scheduler commands, directives, and default job scripts.

use std::fmt;
use std::path::Path;

use crate::cluster::Role;

/// A directive the launcher adds to a script when the script lacks one.
#[derive(Debug, Clone, Copy)]
pub struct Directive {
    /// Matches an existing directive in the script.
    pub regex: &'static str,
    /// minijinja template of the line to insert.
    pub template: &'static str,
}

/// Supported batch schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchSystem {
    Pbs,
    Slurm,
    Sge,
    Lsf,
    HtCondor,
    WindowsHpc,
}

impl fmt::Display for BatchSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pbs => "PBS",
            Self::Slurm => "Slurm",
            Self::Sge => "SGE",
            Self::Lsf => "LSF",
            Self::HtCondor => "HTCondor",
            Self::WindowsHpc => "WindowsHPC",
        })
    }
}

impl BatchSystem {
    pub fn submit_command(self) -> Vec<String> {
        let argv: &[&str] = match self {
            Self::Pbs => &["qsub"],
            Self::Slurm => &["sbatch"],
            Self::Sge => &["qsub"],
            Self::Lsf => &["bsub"],
            Self::HtCondor => &["condor_submit"],
            Self::WindowsHpc => &["job", "submit"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    pub fn delete_command(self) -> Vec<String> {
        let argv: &[&str] = match self {
            Self::Pbs => &["qdel"],
            Self::Slurm => &["scancel"],
            Self::Sge => &["qdel"],
            Self::Lsf => &["bkill"],
            Self::HtCondor => &["condor_rm"],
            Self::WindowsHpc => &["job", "cancel"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    /// Regex and capture group that pull the job id out of submit output.
    pub fn job_id_regex(self) -> (&'static str, usize) {
        match self {
            Self::HtCondor => (r"(\d+)\.\s*$", 1),
            _ => (r"\d+", 0),
        }
    }

    /// The script is piped on stdin rather than passed as an argument.
    pub fn submits_via_stdin(self) -> bool {
        matches!(self, Self::Lsf)
    }

    /// The job-array directive goes at the end of the script.
    pub fn job_array_at_end(self) -> bool {
        matches!(self, Self::HtCondor)
    }

    pub fn script_extension(self) -> &'static str {
        match self {
            Self::WindowsHpc => "xml",
            Self::HtCondor => "condor",
            _ => "sh",
        }
    }

    /// Full submit argv for a script at `script`.
    pub fn submit_argv(self, base: &[String], script: &Path, scheduler: Option<&str>) -> Vec<String> {
        let mut argv = base.to_vec();
        match self {
            Self::Lsf => {}
            Self::WindowsHpc => {
                argv.push(format!("/jobfile:{}", script.display()));
                if let Some(s) = scheduler {
                    argv.push(format!("/scheduler:{s}"));
                }
            }
            _ => argv.push(script.display().to_string()),
        }
        argv
    }

    pub fn delete_argv(self, base: &[String], job_id: &str, scheduler: Option<&str>) -> Vec<String> {
        let mut argv = base.to_vec();
        argv.push(job_id.to_string());
        if let (Self::WindowsHpc, Some(s)) = (self, scheduler) {
            argv.push(format!("/scheduler:{s}"));
        }
        argv
    }

    pub fn job_array(self) -> Option<Directive> {
        Some(match self {
            Self::Pbs => Directive {
                regex: r"#PBS\W+-t\W+[\w\d\-\$]+",
                template: "#PBS -t 1-{{ n }}",
            },
            Self::Slurm => Directive {
                regex: r"#SBATCH\W+(?:--ntasks|-n\b)\W*\$?\w+",
                template: "#SBATCH --ntasks={{ n }}",
            },
            Self::Sge => Directive {
                regex: r"#\$\W+-t",
                template: "#$ -t 1-{{ n }}",
            },
            Self::Lsf => Directive {
                regex: r"#BSUB\s+-J.+\[",
                template: "#BSUB -J kluster-{{ role }}[1-{{ n }}]",
            },
            Self::HtCondor => Directive {
                regex: r"(?m)^\s*queue\b",
                template: "queue {{ n }}",
            },
            Self::WindowsHpc => return None,
        })
    }

    pub fn queue(self) -> Option<Directive> {
        Some(match self {
            Self::Pbs => Directive {
                regex: r"#PBS\W+-q\W+\$?\w+",
                template: "#PBS -q {{ queue }}",
            },
            Self::Slurm => Directive {
                regex: r"#SBATCH\W+(?:--partition|-p)\W+\$?\w+",
                template: "#SBATCH --partition={{ queue }}",
            },
            Self::Sge => Directive {
                regex: r"#\$\W+-q\W+\$?\w+",
                template: "#$ -q {{ queue }}",
            },
            Self::Lsf => Directive {
                regex: r"#BSUB\s+-q\s+\w+",
                template: "#BSUB -q {{ queue }}",
            },
            Self::HtCondor | Self::WindowsHpc => return None,
        })
    }

    pub fn account(self) -> Option<Directive> {
        match self {
            Self::Slurm => Some(Directive {
                regex: r"#SBATCH\W+(?:--account|-A)\W+\$?\w+",
                template: "#SBATCH --account={{ account }}",
            }),
            _ => None,
        }
    }

    pub fn qos(self) -> Option<Directive> {
        match self {
            Self::Slurm => Some(Directive {
                regex: r"#SBATCH\W+--qos\W+\$?\w+",
                template: "#SBATCH --qos={{ qos }}",
            }),
            _ => None,
        }
    }

    pub fn timelimit(self) -> Option<Directive> {
        match self {
            Self::Slurm => Some(Directive {
                regex: r"#SBATCH\W+(?:--time|-t)\W+[\w\d\-:]+",
                template: "#SBATCH --time={{ timelimit }}",
            }),
            Self::Pbs => Some(Directive {
                regex: r"#PBS\W+-l\W+walltime",
                template: "#PBS -l walltime={{ timelimit }}",
            }),
            _ => None,
        }
    }

    /// Script used when no template is configured for `role`.
    pub fn default_template(self, role: Role) -> &'static str {
        match (self, role) {
            (Self::Pbs, _) => "#!/bin/sh\n#PBS -V\n#PBS -N kluster-{{ role }}\n{{ command }}\n",
            (Self::Slurm, _) => {
                "#!/bin/sh\n#SBATCH --job-name=kluster-{{ role }}\nsrun {{ command }}\n"
            }
            (Self::Sge, _) => "#$ -V\n#$ -S /bin/sh\n#$ -N kluster-{{ role }}\n{{ command }}\n",
            (Self::Lsf, _) => {
                "#!/bin/sh\n#BSUB -oo kluster-{{ role }}.o.%J\n#BSUB -eo kluster-{{ role }}.e.%J\n{{ command }}\n"
            }
            (Self::HtCondor, _) => {
                "universe = vanilla\nexecutable = {{ executable }}\narguments = \"{{ arguments }}\"\ngetenv = True\nlog = kluster-{{ role }}.log\n"
            }
            (Self::WindowsHpc, Role::Controller) => WINDOWS_CONTROLLER_JOB,
            (Self::WindowsHpc, Role::Engine) => WINDOWS_ENGINE_JOB,
        }
    }
}

const WINDOWS_CONTROLLER_JOB: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Job Name="kluster-controller" IsExclusive="true" MinCores="1" MaxCores="1" xmlns="http://schemas.microsoft.com/HPCS2008/scheduler/">
  <Tasks>
    <Task Name="controller" MinCores="1" MaxCores="1" WorkDirectory="{{ work_dir }}" CommandLine="{{ command }}" />
  </Tasks>
</Job>
"#;

const WINDOWS_ENGINE_JOB: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Job Name="kluster-engines" MinCores="{{ n }}" MaxCores="{{ n }}" xmlns="http://schemas.microsoft.com/HPCS2008/scheduler/">
  <Tasks>
    <Task Name="engine" Type="ParametricSweep" StartValue="1" EndValue="{{ n }}" IncrementValue="1" MinCores="1" MaxCores="1" WorkDirectory="{{ work_dir }}" CommandLine="{{ command }}" />
  </Tasks>
</Job>
"#;
