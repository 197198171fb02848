//! Word frequency counter pipeline
//!
//! Reads lines from stdin, splits them into words, counts frequencies and
//! prints the top words once the end-of-stream item arrives.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)

use crossbeam::channel::{bounded, Sender};
use stage_pipeline::{
    init_logging, Pipeline, PipelineStage, Result as PipelineResult, Stage, StageContext, StageData,
};
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::time::Duration;

enum Text {
    Line(String),
    Word(String),
    End,
}

/// Splits lines into cleaned, lower-cased words
struct SplitterStage;

impl Stage<Text> for SplitterStage {
    fn run(&mut self, ctx: &StageContext<Text>) -> PipelineResult<()> {
        while !ctx.should_stop() {
            let Some(item) = ctx.next_data() else {
                continue;
            };
            match item.payload() {
                Text::Line(line) => {
                    for word in line.split_whitespace() {
                        let cleaned: String = word
                            .chars()
                            .filter(|c| c.is_alphanumeric())
                            .collect::<String>()
                            .to_lowercase();
                        if cleaned.len() > 2 {
                            ctx.data_complete(StageData::new(Text::Word(cleaned)));
                        }
                    }
                }
                Text::Word(word) => ctx.data_complete(StageData::new(Text::Word(word.clone()))),
                Text::End => ctx.data_complete(StageData::final_item(Text::End)),
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "splitter"
    }
}

/// Counts words and reports the top ten at end of stream
struct CounterStage {
    counts: HashMap<String, usize>,
    done: Sender<Vec<(String, usize)>>,
}

impl CounterStage {
    fn top_n(&self, n: usize) -> Vec<(String, usize)> {
        let mut items: Vec<_> = self.counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        items.into_iter().take(n).collect()
    }
}

impl Stage<Text> for CounterStage {
    fn run(&mut self, ctx: &StageContext<Text>) -> PipelineResult<()> {
        while !ctx.should_stop() {
            let Some(item) = ctx.next_data() else {
                continue;
            };
            if let Text::Word(word) = item.payload() {
                *self.counts.entry(word.clone()).or_insert(0) += 1;
            }
            if item.is_final() {
                let _ = self.done.send(self.top_n(10));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "counter"
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging("warn");

    println!("Word Frequency Counter Pipeline");
    println!("================================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let (done_tx, done_rx) = bounded(1);

    let mut pipeline: Pipeline<Text> = Pipeline::new("word-count");
    pipeline.add_stage(PipelineStage::new(SplitterStage))?;
    pipeline.add_stage(PipelineStage::new(CounterStage {
        counts: HashMap::new(),
        done: done_tx,
    }))?;
    pipeline.initialise()?;
    pipeline.start()?;

    for line in io::stdin().lock().lines() {
        pipeline.inject_data(StageData::new(Text::Line(line?)))?;
    }
    pipeline.inject_data(StageData::final_item(Text::End))?;

    match done_rx.recv_timeout(Duration::from_secs(30)) {
        Ok(top) => {
            println!("\n=== Top {} Words ===", top.len());
            for (i, (word, count)) in top.iter().enumerate() {
                println!("{:2}. {} ({})", i + 1, word, count);
            }
        }
        Err(_) => eprintln!("counter did not finish in time"),
    }

    print!("{}", pipeline.metrics_summary());
    pipeline.stop(true);
    println!("\nProcessing complete!");

    Ok(())
}
