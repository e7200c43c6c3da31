use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serial_executor::executor::FaultSummary;
use serial_executor::{ExecutorConfig, JobOptions, SerialExecutor, Step};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ExecutorConfig::from_env()?;

    let job_count: usize = std::env::var("SERIAL_EXECUTOR_DEMO_JOBS")
        .unwrap_or_else(|_| "5".to_string())
        .parse()
        .unwrap_or(5);

    eprintln!("serial-executor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.name);
    eprintln!("   Idle sleep: {:?}", config.idle_sleep);
    eprintln!("   Jobs: {}\n", job_count);

    let executor = Arc::new(SerialExecutor::new(config));

    let faults = Arc::new(Mutex::new(Vec::new()));
    {
        let faults = Arc::clone(&faults);
        executor.on_fault(move |fault| {
            if let Ok(mut faults) = faults.lock() {
                faults.push(FaultSummary::from(fault));
            }
        });
    }
    executor.on_closed(|stats| {
        eprintln!("   Closed after {} jobs ({} faulted)", stats.executed, stats.faulted);
    });

    executor.start()?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::with_capacity(job_count);
    for i in 0..job_count {
        let order = Arc::clone(&order);
        handles.push(executor.submit_named(format!("ordered-{i}"), move || {
            if let Ok(mut order) = order.lock() {
                order.push(i);
            }
            i * i
        })?);
    }

    let failing = executor.try_submit_with(JobOptions::new().with_label("failing"), || {
        Err::<(), _>(anyhow::anyhow!("simulated failure"))
    })?;

    // Not runnable until 30ms have passed; rotates to the back of the run-list meanwhile.
    let ready_at = Instant::now() + Duration::from_millis(30);
    let deferred = executor.submit_poll_with(JobOptions::new().with_label("deferred"), move || {
        if Instant::now() >= ready_at {
            Step::Ready(Ok::<_, anyhow::Error>("resource ready"))
        } else {
            Step::NotReady
        }
    })?;

    executor.request_stop()?;
    executor.wait()?;

    for handle in &handles {
        println!(
            "{} -> {:?}",
            handle.label().unwrap_or("unnamed"),
            handle.try_get_result()
        );
    }
    println!("failing -> {:?}", failing.error().map(|e| e.to_string()));
    println!(
        "deferred -> {:?} ({} deferrals)",
        deferred.try_get_result(),
        deferred.info().deferrals
    );
    println!("order -> {:?}", order.lock().map(|o| o.clone()).unwrap_or_default());

    let faults = faults.lock().map(|f| f.clone()).unwrap_or_default();
    println!("faults -> {}", serde_json::to_string_pretty(&faults)?);
    println!("stats -> {}", serde_json::to_string_pretty(&executor.stats())?);

    Ok(())
}
