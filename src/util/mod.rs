pub mod delivery_queue;
