mod runs;
mod scheduling;
