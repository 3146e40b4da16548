//! LLM-driven navigation to the filtered list page
//!
//! First runs walk the model through at most `max_nav_steps` interactions
//! (apply filters, pick categories, search) until it declares `done`, and
//! every successful step is recorded. Resumed runs replay the recorded steps
//! instead, no model in the loop.

use std::time::Duration;

use log::{info, warn};

use crate::actions::{Action, ActionExecutor, NavStep};
use crate::browser::{xpath, PageHandle};
use crate::config::CollectorConfig;
use crate::llm::decisions::NavDecision;
use crate::llm::{chat_for_message, LlmClient};
use crate::som::{
    build_mark_id_to_xpath_map, capture_screenshot_base64, format_marks_for_llm, inject_and_scan,
    resolve_single_mark_id,
};
use crate::utils::sleep_jittered;

const NAVIGATION_SYSTEM_PROMPT: &str = "\
You operate a web page to reach the list described by a task. Interactive \
elements carry numbered marks. One step per reply, JSON only: \
{\"action\": \"click\"|\"type\"|\"press\"|\"scroll\"|\"wait\"|\"done\", \
\"args\": {...}, \"thinking\": \"...\"}. click args: mark_id, target_text. \
type args: mark_id, target_text, text, optional key. Reply done when the \
list already shows the entries the task asks for.";

/// Drive the model to the filtered list page, recording replayable steps
pub async fn run_navigation_phase(
    executor: &mut ActionExecutor<'_>,
    llm: &dyn LlmClient,
    task_description: &str,
    config: &CollectorConfig,
) -> (Vec<NavStep>, bool) {
    let mut nav_steps = Vec::new();

    for step_index in 0..config.max_nav_steps {
        sleep_jittered(config.action_delay_base, config.action_delay_random).await;

        let page = executor.page();
        let snapshot = match inject_and_scan(page.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("navigation snapshot failed: {e}");
                return (nav_steps, false);
            }
        };
        let screenshot = match capture_screenshot_base64(page.as_ref()).await {
            Ok((_, encoded)) => encoded,
            Err(e) => {
                warn!("navigation screenshot failed: {e}");
                return (nav_steps, false);
            }
        };

        let user = format!(
            "Task: {task_description}\nCurrent URL: {}\nMarked elements:\n{}",
            snapshot.url,
            format_marks_for_llm(&snapshot, 60)
        );
        let decision = match chat_for_message(llm, NAVIGATION_SYSTEM_PROMPT, &user, &[screenshot])
            .await
            .and_then(|message| NavDecision::from_message(&message))
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!("navigation decision failed at step {step_index}: {e}");
                return (nav_steps, false);
            }
        };

        let action = match decision {
            NavDecision::Done => {
                info!("navigation complete after {} step(s)", nav_steps.len());
                return (nav_steps, true);
            }
            NavDecision::Click { mark_id, target_text } => {
                match resolve_single_mark_id(
                    page.as_ref(),
                    llm,
                    &snapshot,
                    mark_id,
                    &target_text,
                    config.max_validation_retries,
                )
                .await
                {
                    Ok(resolved) => Action::Click {
                        mark_id: resolved,
                        target_text: (!target_text.is_empty()).then_some(target_text),
                    },
                    Err(e) => {
                        warn!("navigation click target unresolved: {e}");
                        continue;
                    }
                }
            }
            NavDecision::Type { mark_id, target_text, text, key } => {
                match resolve_single_mark_id(
                    page.as_ref(),
                    llm,
                    &snapshot,
                    mark_id,
                    &target_text,
                    config.max_validation_retries,
                )
                .await
                {
                    Ok(resolved) => Action::Type {
                        mark_id: resolved,
                        text,
                        target_text: (!target_text.is_empty()).then_some(target_text),
                        expectation: None,
                        key,
                    },
                    Err(e) => {
                        warn!("navigation type target unresolved: {e}");
                        continue;
                    }
                }
            }
            NavDecision::Press { key } => Action::Press { mark_id: None, key },
            NavDecision::Scroll => Action::Scroll { delta: None },
            NavDecision::Wait { timeout_ms } => Action::Wait { timeout_ms },
        };

        let mark_map = build_mark_id_to_xpath_map(&snapshot);
        let (result, nav_step) = executor.execute(&action, &mark_map, step_index).await;
        if result.success {
            if let Some(step) = nav_step {
                nav_steps.push(step);
            }
        } else {
            warn!(
                "navigation step {step_index} failed: {}",
                result.error.as_deref().unwrap_or("unknown")
            );
        }
    }

    warn!("navigation step budget exhausted without done");
    (nav_steps, false)
}

/// Replay recorded nav steps on a fresh page. Each step resolves through its
/// stored xpath alternatives; a step none of them can locate fails the
/// replay.
pub async fn replay_nav_steps(
    executor: &mut ActionExecutor<'_>,
    steps: &[NavStep],
    config: &CollectorConfig,
) -> bool {
    for step in steps {
        if !step.success {
            continue;
        }
        sleep_jittered(config.action_delay_base, config.action_delay_random).await;

        match step.action.as_str() {
            "click" | "type" => {
                let Some(selector) = locate_step_target(executor, step).await else {
                    warn!("replay could not locate target of step {}", step.step);
                    return false;
                };
                let page = executor.page();
                let ok = if step.action == "type" {
                    let value = step.value.as_deref().unwrap_or_default();
                    let filled = matches!(
                        xpath::fill(page.as_ref(), &selector, value, 0).await,
                        Ok(true)
                    );
                    if filled {
                        if let Some(key) = &step.key {
                            let _ = page.keyboard_press(key).await;
                        }
                    }
                    filled
                } else {
                    matches!(xpath::click(page.as_ref(), &selector, 0).await, Ok(true))
                };
                if !ok {
                    warn!("replay step {} did not execute", step.step);
                    return false;
                }
            }
            "press" => {
                if let Some(key) = &step.key {
                    let _ = executor.page().keyboard_press(key).await;
                }
            }
            "scroll" => {
                let _ = executor.page().scroll_by(0.0, 300.0).await;
            }
            "navigate" => {
                if let Some(url) = &step.value {
                    if executor
                        .page()
                        .goto(url, Duration::from_secs(30))
                        .await
                        .is_err()
                    {
                        return false;
                    }
                }
            }
            _ => {}
        }

        tokio::time::sleep(Duration::from_secs_f64(config.page_load_delay)).await;
    }
    info!("replayed {} nav step(s)", steps.len());
    true
}

async fn locate_step_target(executor: &ActionExecutor<'_>, step: &NavStep) -> Option<String> {
    let page = executor.page();
    let mut candidates: Vec<&String> = step.xpath_alternatives.iter().collect();
    if let Some(target) = &step.target_xpath {
        if !candidates.contains(&target) {
            candidates.insert(0, target);
        }
    }
    for candidate in candidates {
        if matches!(xpath::unique_visible(page.as_ref(), candidate).await, Ok(true)) {
            return Some(candidate.clone());
        }
    }
    None
}
