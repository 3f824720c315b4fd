use super::{RunResults, SampleResult};
use crate::mimsi::bags::SampleBags;
use crate::mimsi::model::BagClassifier;
use crate::utils::{Device, Result};
use std::io::Write;

/// Runs every bag of every sample through the classifier.
///
/// The classifier is switched to inference mode once for the whole run and
/// bags are placed on its device when that device is accelerated.
/// Samples and bags are evaluated strictly in the order the source yields
/// them. After a sample's last bag its progress line is written to
/// `progress`; the first error from the source, the classifier or the
/// progress sink aborts the run and the unfinished sample is dropped.
pub fn evaluate_samples<C, I, W>(
    classifier: &mut C,
    samples: I,
    progress: &mut W,
) -> Result<RunResults>
where
    C: BagClassifier + ?Sized,
    I: IntoIterator<Item = Result<SampleBags>>,
    W: Write,
{
    classifier.set_inference_mode();
    let classifier = &*classifier;
    let device = classifier.device();

    let mut results = RunResults::default();
    for sample in samples {
        let record = evaluate_sample(classifier, sample?, device)?;
        writeln!(progress, "{}", record)
            .and_then(|_| progress.flush())
            .map_err(|e| format!("Failed to write progress: {}", e))?;
        results.push(record);
    }
    log::info!("Evaluated {} sample(s)", results.len());
    Ok(results)
}

fn evaluate_sample<C>(classifier: &C, sample: SampleBags, device: Device) -> Result<SampleResult>
where
    C: BagClassifier + ?Sized,
{
    let SampleBags {
        sample_id,
        label,
        bags,
    } = sample;

    let num_bags = bags.len();
    let mut probabilities = Vec::with_capacity(num_bags);
    let mut positives = 0;
    for (bag_index, bag) in bags.into_iter().enumerate() {
        let bag = if device.is_accelerated() {
            bag.to_device(device)
        } else {
            bag
        };
        let evaluation = classifier.evaluate(&bag, label).map_err(|e| {
            format!(
                "Sample {}: bag {}/{}: {}",
                sample_id,
                bag_index + 1,
                num_bags,
                e
            )
        })?;
        if evaluation.decision {
            positives += 1;
        }
        probabilities.push(evaluation.probability);
    }

    let record = SampleResult {
        sample_id,
        probabilities,
    };
    if let Some(summary) = record.summary() {
        log::info!(
            "{}: mean={:.4} median={:.4} sd={:.4} range=[{:.4},{:.4}] positive={}/{}",
            record.sample_id,
            summary.mean,
            summary.median,
            summary.std_dev,
            summary.min,
            summary.max,
            positives,
            num_bags
        );
    }
    Ok(record)
}
