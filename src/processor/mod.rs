pub mod location_processor;
