use std::time::Duration;

use clap::{Parser, Subcommand};
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use userhub::proto::auth::auth_client::AuthClient;
use userhub::proto::auth::{LoginRequest, RefreshTokensRequest, SignUpRequest, TokenPairResponse};
use userhub::proto::follow::follow_graph_client::FollowGraphClient;
use userhub::proto::follow::{FollowRequest, RelationsRequest};
use userhub::proto::userinfo::user_info_client::UserInfoClient;
use userhub::proto::userinfo::{
    FindUsersByLoginRequest, GetUserRequest, GetUsersRequest, User, UsersExistRequest,
};

#[derive(Parser)]
#[command(name = "userhub-client")]
#[command(about = "Command-line client for the userhub gRPC services", long_about = None)]
struct Cli {
    #[arg(short, long, env = "USERHUB_SERVER", default_value = "http://127.0.0.1:50051")]
    server: String,

    /// Per-call deadline in milliseconds, sent as grpc-timeout
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new user and print its tokens
    SignUp {
        #[arg(short, long)]
        login: String,

        #[arg(short, long)]
        email: String,

        #[arg(short, long)]
        password: String,
    },

    /// Exchange credentials for a token pair
    Login {
        #[arg(short, long)]
        login: String,

        #[arg(short, long)]
        password: String,
    },

    /// Rotate a refresh token
    Refresh {
        #[arg(short, long)]
        token: String,
    },

    /// Show one user
    User { id: u64 },

    /// Show several users
    Users {
        #[arg(value_delimiter = ',', help = "Comma-separated user IDs")]
        ids: Vec<u64>,
    },

    /// Check that every id belongs to a user
    Exist {
        #[arg(value_delimiter = ',', help = "Comma-separated user IDs")]
        ids: Vec<u64>,
    },

    /// Search users by login substring
    Find { login: String },

    /// Make SOURCE follow TARGET
    Follow { source: u64, target: u64 },

    /// Make SOURCE stop following TARGET
    Unfollow { source: u64, target: u64 },

    /// List the users following ID
    Followers { id: u64 },

    /// List the users ID follows
    Followees { id: u64 },
}

fn request<T>(message: T, timeout: Duration) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(timeout);
    request
}

fn print_tokens(tokens: TokenPairResponse) {
    println!("Access token:  {}", tokens.access_token);
    println!("Refresh token: {}", tokens.refresh_token);
}

fn print_users(users: &[User]) {
    if users.is_empty() {
        println!("No users");
        return;
    }

    println!("{:>8}  {:<24}  {}", "ID", "LOGIN", "EMAIL");
    for user in users {
        println!("{:>8}  {:<24}  {}", user.id, user.login, user.email);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let channel: Channel = Endpoint::from_shared(cli.server.clone())?
        .connect()
        .await?;
    let timeout = Duration::from_millis(cli.timeout_ms);

    let result = match cli.command {
        Commands::SignUp {
            login,
            email,
            password,
        } => {
            let message = SignUpRequest {
                login,
                email,
                password,
            };
            let mut client = AuthClient::new(channel);
            client
                .sign_up(request(message, timeout))
                .await
                .map(|r| print_tokens(r.into_inner()))
        }

        Commands::Login { login, password } => {
            let mut client = AuthClient::new(channel);
            client
                .login(request(LoginRequest { login, password }, timeout))
                .await
                .map(|r| print_tokens(r.into_inner()))
        }

        Commands::Refresh { token } => {
            let mut client = AuthClient::new(channel);
            client
                .refresh_tokens(request(
                    RefreshTokensRequest {
                        refresh_token: token,
                    },
                    timeout,
                ))
                .await
                .map(|r| print_tokens(r.into_inner()))
        }

        Commands::User { id } => {
            let mut client = UserInfoClient::new(channel);
            client
                .get_user(request(GetUserRequest { id }, timeout))
                .await
                .map(|r| print_users(r.into_inner().user.as_slice()))
        }

        Commands::Users { ids } => {
            let mut client = UserInfoClient::new(channel);
            client
                .get_users(request(GetUsersRequest { ids }, timeout))
                .await
                .map(|r| print_users(&r.into_inner().users))
        }

        Commands::Exist { ids } => {
            let mut client = UserInfoClient::new(channel);
            client
                .users_exist(request(UsersExistRequest { ids }, timeout))
                .await
                .map(|r| println!("{}", r.into_inner().exist))
        }

        Commands::Find { login } => {
            let mut client = UserInfoClient::new(channel);
            client
                .find_users_by_login(request(FindUsersByLoginRequest { login }, timeout))
                .await
                .map(|r| print_users(&r.into_inner().users))
        }

        Commands::Follow { source, target } => {
            let message = FollowRequest {
                source_id: source,
                target_id: target,
            };
            let mut client = FollowGraphClient::new(channel);
            client
                .follow(request(message, timeout))
                .await
                .map(|_| println!("User {source} now follows user {target}"))
        }

        Commands::Unfollow { source, target } => {
            let message = FollowRequest {
                source_id: source,
                target_id: target,
            };
            let mut client = FollowGraphClient::new(channel);
            client
                .unfollow(request(message, timeout))
                .await
                .map(|_| println!("User {source} no longer follows user {target}"))
        }

        Commands::Followers { id } => {
            let mut client = FollowGraphClient::new(channel);
            client
                .followers(request(RelationsRequest { id }, timeout))
                .await
                .map(|r| print_users(&r.into_inner().users))
        }

        Commands::Followees { id } => {
            let mut client = FollowGraphClient::new(channel);
            client
                .followees(request(RelationsRequest { id }, timeout))
                .await
                .map(|r| print_users(&r.into_inner().users))
        }
    };

    if let Err(status) = result {
        eprintln!("Failed ({:?}): {}", status.code(), status.message());
        std::process::exit(1);
    }

    Ok(())
}
