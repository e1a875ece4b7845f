//! Basic usage example of the query cache.

use query_kit::storage::{InMemoryStorage, StorageAdapter};
use query_kit::{
    error::Result, MutationObserver, MutationOptions, QueryClient, QueryConfig, QueryKey,
    QueryObserver, QueryOptions,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Example entity: Employment
#[derive(Clone, Serialize, Deserialize, Debug)]
struct Employment {
    id: String,
    loanapp_id: String,
    employer_name: String,
    salary: f64,
    hire_date: String,
}

/// Simulated remote API.
async fn fetch_employment(id: String) -> std::result::Result<Employment, String> {
    println!("  [API] Fetching employment: {}", id);
    tokio::time::sleep(Duration::from_millis(50)).await;

    match id.as_str() {
        "emp_001" => Ok(Employment {
            id,
            loanapp_id: "loan_123".to_string(),
            employer_name: "Acme Corp".to_string(),
            salary: 75000.0,
            hire_date: "2023-01-15".to_string(),
        }),
        "emp_002" => Ok(Employment {
            id,
            loanapp_id: "loan_456".to_string(),
            employer_name: "Tech Inc".to_string(),
            salary: 95000.0,
            hire_date: "2022-06-01".to_string(),
        }),
        _ => Err(format!("employment {} not found", id)),
    }
}

fn employment_key(id: &str) -> QueryKey {
    QueryKey::new(["employment", id])
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Query Kit - Basic Example ===\n");

    // 1. Initialize storage and client
    println!("1. Initializing in-memory storage and client...");
    let storage = InMemoryStorage::new();
    storage.initialize().await?;
    let client = QueryClient::builder()
        .config(QueryConfig::default().with_stale_duration(Duration::from_secs(30)))
        .storage(storage.clone())
        .build()?;
    println!("   ✓ Client ready\n");

    // 2. Two observers on the same key share one fetch
    println!("2. Two observers for employment emp_001:");
    let first = QueryObserver::new(
        &client,
        employment_key("emp_001"),
        || fetch_employment("emp_001".to_string()),
        QueryOptions::new().persisted(),
    )?;
    let second = QueryObserver::new(
        &client,
        employment_key("emp_001"),
        || fetch_employment("emp_001".to_string()),
        QueryOptions::new().persisted(),
    )?;
    let _sub = first.subscribe(|result| {
        if let Some(emp) = result.data() {
            println!("   → observer saw {} (stale: {})", emp.employer_name, result.is_stale);
        }
    });

    let (a, b) = tokio::join!(first.refetch(), second.refetch());
    b?;
    if let Some(emp) = &a?.data {
        println!(
            "   ✓ Employment loaded once: {} from {} (${:.2})\n",
            emp.employer_name, emp.id, emp.salary
        );
    }

    // 3. Fresh data is served from the cache
    println!("3. Fetching emp_001 through the client:");
    let state = client
        .fetch_query(employment_key("emp_001"), || {
            fetch_employment("emp_001".to_string())
        })
        .await?;
    if let Some(emp) = &state.data {
        println!("   ✓ Served from cache: {}\n", emp.employer_name);
    }

    // 4. Failures are retried, then reported in the state
    println!("4. Unknown employment (emp_404), one retry:");
    let missing = QueryObserver::new(
        &client,
        employment_key("emp_404"),
        || fetch_employment("emp_404".to_string()),
        QueryOptions::new().retry(1, Duration::from_millis(100)),
    )?;
    let state = missing.refetch().await?;
    if let Some(error) = &state.error {
        println!("   ✓ Settled in error: {}\n", error);
    }

    // 5. A mutation invalidates the employment family
    println!("5. Raising salary through a mutation:");
    let raise = MutationObserver::new(
        &client,
        |(id, amount): (String, f64)| async move {
            println!("  [API] Raising {} by ${:.2}", id, amount);
            Ok::<_, String>(())
        },
        MutationOptions::new().invalidates([QueryKey::new(["employment"])]),
    );
    let result = raise.mutate(("emp_001".to_string(), 5000.0)).await;
    println!("   ✓ Mutation status: {:?}\n", result.status);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // 6. Persisted records
    println!("6. Persisted records:");
    for key in storage.keys().await? {
        println!("   • {}", key);
    }

    println!("\n=== Example Complete ===\n");
    Ok(())
}
