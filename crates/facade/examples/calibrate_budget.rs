//! Compare the noise each accountant needs for the same budget, then
//! checkpoint a ledger to JSON and resume from it.

use dp_engine::{
    steps_for_epochs, AccountantKind, GdpAccountant, LedgerSnapshot, NoiseCalibrator,
    PrivacyAccountant, RdpAccountant, RdpConversion, StepRecord,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let (delta, sample_rate) = (1e-5, 256.0 / 60_000.0);
    let steps = steps_for_epochs(15.0, sample_rate)?;

    let rdp = RdpAccountant::new();
    let improved = RdpAccountant::new().with_conversion(RdpConversion::Improved);
    let gdp = GdpAccountant::new();
    let accountants: [(&str, &dyn PrivacyAccountant); 3] =
        [("rdp", &rdp), ("rdp-improved", &improved), ("gdp", &gdp)];

    println!("{steps} steps at q={sample_rate:.5}, delta={delta:e}");
    for target in [1.0, 2.0, 4.0, 8.0] {
        let mut row = format!("eps={target:<4}");
        for (name, accountant) in accountants {
            let sigma =
                NoiseCalibrator::new(accountant).calibrate(target, delta, sample_rate, steps)?;
            row.push_str(&format!("  {name}: sigma={sigma:.4}"));
        }
        println!("{row}");
    }

    // Half the schedule, saved and reloaded.
    let record = StepRecord::new(sample_rate, 1.1)?;
    let partial = LedgerSnapshot::uniform(record, steps / 2);
    let json = serde_json::to_string(&partial)?;
    let resumed: LedgerSnapshot = serde_json::from_str(&json)?;
    let accountant = AccountantKind::Rdp.build();
    let spend = accountant.privacy_spent(&resumed, delta)?;
    println!(
        "checkpoint {json} -> {} steps, eps={:.3} at order {:?}",
        resumed.len(),
        spend.epsilon,
        spend.order
    );
    Ok(())
}
