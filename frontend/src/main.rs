use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::warn;

use tesserae::graph::GraphInfo;
use tesserae::pprint::solution_summary;

mod json;
mod viz;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    subcmd: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Solve a problem and write the schedule
    Solve {
        /// Problem JSON
        input: PathBuf,
        /// Solution JSON to write
        output: PathBuf,
    },
    /// Write Graphviz artifacts for a problem and, optionally, a solution
    Visualize {
        /// Problem JSON
        input: PathBuf,
        /// Solution JSON to overlay as subgraph clusters
        #[arg(long)]
        solution: Option<PathBuf>,
        /// Directory for the .dot/.png artifacts
        #[arg(long, default_value = "viz")]
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.subcmd {
        Subcommand::Solve { input, output } => cmd_solve(&input, &output),
        Subcommand::Visualize {
            input,
            solution,
            out_dir,
        } => cmd_visualize(&input, solution.as_deref(), &out_dir),
    }
}

fn cmd_solve(input: &std::path::Path, output: &std::path::Path) -> Result<()> {
    let problem = json::read_problem(input)?;
    println!(
        "problem: {} tensors, {} ops, capacity={}, bandwidth={}, native=[{},{}]",
        problem.tensors.len(),
        problem.ops.len(),
        problem.fast_memory_capacity,
        problem.slow_memory_bandwidth,
        problem.native_granularity[0],
        problem.native_granularity[1]
    );

    let solution = tesserae::solve(&problem)?;
    let total =
        tesserae::evaluate(&problem, &solution).context("solved schedule failed validation")?;

    json::write_solution(output, &solution)?;

    print!("{}", solution_summary(&solution));
    println!("verified total latency: {total:.1}");
    println!("wrote {}", output.display());
    Ok(())
}

fn cmd_visualize(
    input: &std::path::Path,
    solution: Option<&std::path::Path>,
    out_dir: &std::path::Path,
) -> Result<()> {
    let problem = json::read_problem(input)?;
    let gi = GraphInfo::analyze(&problem)?;
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let mut artifacts = vec![("problem", viz::problem_dot(&problem, &gi))];
    if let Some(solution_path) = solution {
        let solution = json::read_solution(solution_path)?;
        artifacts.push(("solution", viz::solution_dot(&problem, &gi, &solution)));
    }

    for (name, dot) in artifacts {
        let dot_path = out_dir.join(format!("{name}.dot"));
        std::fs::write(&dot_path, &dot)
            .with_context(|| format!("writing {}", dot_path.display()))?;
        println!("wrote {}", dot_path.display());

        let png_path = out_dir.join(format!("{name}.png"));
        match viz::render_png(&dot_path, &png_path) {
            Ok(()) => println!("wrote {}", png_path.display()),
            Err(err) => {
                warn!("could not render PNG: {err:#}");
                println!("render manually with: dot -Tpng {} -o {}", dot_path.display(), png_path.display());
            }
        }
    }
    Ok(())
}
