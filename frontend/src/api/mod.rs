pub mod presence_socket;
