use anyhow::{Context, Result};
use clap::Parser;
use rv32i_sim::cpu::{Cpu, CoreType, DEFAULT_MEM_SIZE, DEFAULT_PC_BOUND};
use rv32i_sim::fault::{FaultKind, FaultSpec};

/// Cycle-accurate RV32I pipeline simulator with an in-line entropy
/// extractor and a fault-injection hook.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, arg_required_else_help = true)]
struct Args {
    /// Path to a raw binary program image, loaded at address 0.
    input: String,

    /// Memory size in bytes.
    #[arg(long, default_value_t = DEFAULT_MEM_SIZE)]
    mem_size: usize,

    /// Instruction-memory bound used by decode's PC-out-of-bound check.
    #[arg(long, default_value_t = DEFAULT_PC_BOUND)]
    pc_bound: u32,

    /// Maximum number of cycles to run before giving up.
    #[arg(long, default_value_t = 10_000)]
    max_cycles: u64,

    /// 1-based decode-stage cycle at which to inject a fault.
    #[arg(long, requires = "fi_bit")]
    fi_cycle: Option<u64>,

    /// Starting bit index of the targeted fault range.
    #[arg(long, requires = "fi_cycle")]
    fi_bit: Option<u32>,

    /// Number of bits the fault targets, starting at `fi_bit`.
    #[arg(long, default_value_t = 1)]
    fi_width: u32,

    /// How the targeted bits are perturbed.
    #[arg(long, value_enum, default_value_t = FiKindArg::Flip)]
    fi_kind: FiKindArg,

    /// Print logs during simulation.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Run with the entropy extractor wired active from the start, scanning
    /// and flushing six bits of entropy per `OP` instruction before
    /// replaying the image for real. Off by default, matching how every
    /// ordinary program image (as opposed to a dedicated entropy capture
    /// run) is meant to execute.
    #[arg(long)]
    entropy: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum FiKindArg {
    Flip,
    Set,
    Clear,
}

impl From<FiKindArg> for FaultKind {
    fn from(arg: FiKindArg) -> Self {
        match arg {
            FiKindArg::Flip => FaultKind::Flip,
            FiKindArg::Set => FaultKind::Set,
            FiKindArg::Clear => FaultKind::Clear,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let image = std::fs::read(&args.input)
        .with_context(|| format!("could not read file `{}`", &args.input))?;

    let core_type = if args.entropy {
        CoreType::SingleEntropy
    } else {
        CoreType::Single
    };
    let cpu = Cpu::new(args.mem_size, args.pc_bound, core_type);
    cpu.load_image(&image);

    if let (Some(cycle), Some(bit_index)) = (args.fi_cycle, args.fi_bit) {
        cpu.set_fault(Some(FaultSpec {
            cycle,
            bit_index,
            num_bits: args.fi_width,
            kind: args.fi_kind.into(),
        }));
        tracing::info!(cycle, bit_index, "fault injection armed");
    }

    let halted = cpu.run(args.max_cycles).with_context(|| "simulation aborted")?;
    if halted {
        tracing::info!(cycle = cpu.kernel.cycle(), "halted on STOP sentinel");
    } else {
        tracing::warn!(max_cycles = args.max_cycles, "cycle budget exhausted without halting");
    }

    for idx in 1..32u32 {
        let val = cpu.regfile.read(idx);
        if val != 0 {
            println!("x{idx:<2} = 0x{}", rv32i_sim::util::format_reg_val(val));
        }
    }

    Ok(())
}
