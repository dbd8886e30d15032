//! Two kinds of students using a todo-list API at the same time.
//!
//! Studiers keep polling their todo list. Their numbers ramp up to 1,500 over the first
//! minute, up again to 7,500 over the next three minutes, then back down to none over
//! the last two. Each studier thinks for two minutes between polls.
//!
//! Meanwhile, 20 indecisive planners share 400 iterations of creating a todo with a
//! typo in its title, thinking about it for a while, then deleting it.
//!
//! Run it against a todo API with:
//!
//! ```bash
//! $ cargo run --release --example planners_and_studiers -- --host http://127.0.0.1:6400
//! ```

use gander::prelude::*;
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), GanderError> {
    GanderAttack::initialize()?
        .register_scenario(
            Scenario::new("studier", task!(studying_student).set_name("list todos"))
                .set_executor("ramping:1500,1m;7500,3m;0,2m".parse()?)
                // Take two minutes to look over the list before checking it again.
                .set_wait_time(Duration::from_secs(120), Duration::from_secs(120))?,
        )
        .register_scenario(
            Scenario::new("planner", task!(indecisive_planner))
                .set_executor(ScenarioExecutor::shared_iterations(20, 400)),
        )
        .execute()
        .await?;

    Ok(())
}

/// Load the whole todo list.
async fn studying_student(user: &mut VirtualUser) -> TaskResult {
    let response = user.get("/api/v1/todos")?.send().await?;
    VirtualUser::check_status(&response, StatusCode::OK)
}

/// Create a todo, regret it, and delete it again.
async fn indecisive_planner(user: &mut VirtualUser) -> TaskResult {
    user.set_label("create and delete todo");

    let response = user
        .post("/api/v1/todos")?
        .json(&json!({
            "title": "CSSE6400 Clout Assignment",
            "completed": false,
            "description": "",
            "deadline_at": "2025-09-05T15:00:00",
        }))
        .send()
        .await?;
    VirtualUser::check_status(&response, StatusCode::OK)?;
    let body = response.text().await?;

    tokio::time::sleep(Duration::from_secs(10)).await;

    // Without an id there's nothing to delete, so this iteration ends as a failure.
    let id = match serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|todo| todo.get("id").cloned())
    {
        Some(serde_json::Value::Number(id)) => id.to_string(),
        Some(serde_json::Value::String(id)) => id,
        _ => return Err(TaskError::custom("created todo has no id")),
    };

    let response = user.delete(&format!("/api/v1/todos/{}", id))?.send().await?;
    VirtualUser::check_status(&response, StatusCode::OK)?;

    tokio::time::sleep(Duration::from_secs(10)).await;

    Ok(())
}
