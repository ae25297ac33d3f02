mod common;
mod containers;
mod rabbitmq_tests;
