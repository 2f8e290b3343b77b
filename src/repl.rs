//! Interactive chat loop.

use crate::command;
use crate::controller::Controller;
use crate::message::StreamEvent;
use anyhow::Result;
use std::io::{self, Write};
use std::ops::ControlFlow;

pub async fn run(controller: &mut Controller) -> Result<()> {
    println!("tandem - AI pair programmer");
    println!(
        "Active provider: {}. Type a message, /help for commands, or 'quit' to exit.",
        controller.active_provider()
    );
    println!();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break; // EOF
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        if input.starts_with('/') {
            match controller.dispatch_command(input).await {
                Ok(outcome) if outcome.handled => {
                    if let Some(text) = outcome.response {
                        println!("{}", text);
                    }
                }
                Ok(_) => {
                    println!("Unknown command: {}", input);
                    println!("Available: {}", command::command_list());
                }
                Err(e) => eprintln!("error: {}", e),
            }
            println!();
            continue;
        }

        let result = controller
            .send_user_turn(input, |event| {
                if let StreamEvent::TextDelta(delta) = event {
                    print!("{}", delta);
                    let _ = io::stdout().flush();
                }
                ControlFlow::Continue(())
            })
            .await;

        match result {
            Ok(outcome) => {
                println!();
                if outcome.needs_compaction {
                    println!(
                        "[context at {:.0}%: run /compact to reclaim budget]",
                        outcome.context.percentage * 100.0
                    );
                }
            }
            Err(e) => eprintln!("\nerror: {}", e),
        }
        println!();
    }

    Ok(())
}
