mod dedup;
mod failures;
mod gang;
mod pipeline;
mod priority;
mod suspend;
mod throttle;
mod transforms;
